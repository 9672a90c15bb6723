//! Create participant table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Participant::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Participant::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Participant::DisplayName).string().null())
                    .col(ColumnDef::new(Participant::DmLink).text().null())
                    .col(ColumnDef::new(Participant::GameName).string().null())
                    .col(
                        ColumnDef::new(Participant::GameNameAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Participant::Images)
                            .json_binary()
                            .not_null()
                            .default(Expr::cust("'[]'::jsonb")),
                    )
                    .col(
                        ColumnDef::new(Participant::Videos)
                            .json_binary()
                            .not_null()
                            .default(Expr::cust("'[]'::jsonb")),
                    )
                    .col(
                        ColumnDef::new(Participant::StepState)
                            .string_len(32)
                            .not_null()
                            .default("game_name"),
                    )
                    .col(
                        ColumnDef::new(Participant::Score)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Participant::Reacted)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Participant::Invite)
                            .json_binary()
                            .not_null()
                            .default(Expr::cust("'{}'::jsonb")),
                    )
                    .col(
                        ColumnDef::new(Participant::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // Review tooling lists participants waiting on a decision
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_participant_step_state")
                    .table(Participant::Table)
                    .col(Participant::StepState)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Participant::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(Iden)]
enum Participant {
    Table,
    Id,
    DisplayName,
    DmLink,
    GameName,
    GameNameAt,
    Images,
    Videos,
    StepState,
    Score,
    Reacted,
    Invite,
    UpdatedAt,
}
