use sea_orm_migration::prelude::*;

use crate::db::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(VesperMutations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(VesperMutations::Id)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(VesperMutations::RequestContext).text().not_null())
                    .col(ColumnDef::new(VesperMutations::ChangeCount).integer().not_null())
                    .col(ColumnDef::new(VesperMutations::ChangesByNode).text().not_null())
                    .col(
                        ColumnDef::new(VesperMutations::CommittedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_vesper_mutations_committed_at")
                    .table(VesperMutations::Table)
                    .col(VesperMutations::CommittedAt)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(VesperChanges::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(VesperChanges::MutationId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(VesperChanges::Sequence).integer().not_null())
                    .col(ColumnDef::new(VesperChanges::Node).string().not_null())
                    .col(ColumnDef::new(VesperChanges::Kind).small_integer().not_null())
                    .col(ColumnDef::new(VesperChanges::OldValue).text().null())
                    .col(ColumnDef::new(VesperChanges::NewValue).text().null())
                    .col(
                        ColumnDef::new(VesperChanges::ExecutedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .name("pk_vesper_changes")
                            .col(VesperChanges::MutationId)
                            .col(VesperChanges::Sequence),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_vesper_changes_mutation")
                            .from(VesperChanges::Table, VesperChanges::MutationId)
                            .to(VesperMutations::Table, VesperMutations::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_vesper_changes_node")
                    .table(VesperChanges::Table)
                    .col(VesperChanges::MutationId)
                    .col(VesperChanges::Node)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(VesperAssignments::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(VesperAssignments::SubscriptionId)
                            .string_len(36)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(VesperAssignments::Node).string().not_null())
                    .col(
                        ColumnDef::new(VesperAssignments::Owner)
                            .string_len(36)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(VesperAssignments::LastVisitedMutationId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(VesperAssignments::LeaseExpiresAt)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(VesperAssignments::Since).big_integer().not_null())
                    .col(
                        ColumnDef::new(VesperAssignments::CreatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(VesperAssignments::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(VesperChanges::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(VesperMutations::Table).to_owned())
            .await?;
        Ok(())
    }
}
