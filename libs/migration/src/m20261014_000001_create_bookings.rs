use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // One row per dedup_id; redeliveries hit the unique key
        manager
            .create_table(
                Table::create()
                    .table(Bookings::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Bookings::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Bookings::DedupId)
                            .string_len(128)
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Bookings::GroupKey).string_len(128).not_null())
                    .col(ColumnDef::new(Bookings::BookingId).uuid().not_null())
                    .col(ColumnDef::new(Bookings::UserId).string_len(255).not_null())
                    .col(ColumnDef::new(Bookings::ServiceId).string_len(255).not_null())
                    .col(
                        ColumnDef::new(Bookings::BookingTime)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(json_binary(Bookings::Payload).not_null().default("{}"))
                    .col(
                        ColumnDef::new(Bookings::Status)
                            .string_len(32)
                            .not_null()
                            .default("completed"),
                    )
                    .col(
                        timestamp_with_time_zone(Bookings::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_bookings_group_key")
                    .table(Bookings::Table)
                    .col(Bookings::GroupKey)
                    .col(Bookings::Id)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_bookings_booking_id")
                    .table(Bookings::Table)
                    .col(Bookings::BookingId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(BookingDeadLetters::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(BookingDeadLetters::MessageId)
                            .string_len(128)
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(BookingDeadLetters::DedupId)
                            .string_len(128)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BookingDeadLetters::GroupKey)
                            .string_len(128)
                            .not_null(),
                    )
                    .col(json_binary(BookingDeadLetters::Payload).not_null())
                    .col(
                        ColumnDef::new(BookingDeadLetters::ReceiveCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(BookingDeadLetters::Reason)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(text(BookingDeadLetters::Error))
                    .col(
                        timestamp_with_time_zone(BookingDeadLetters::FailedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_booking_dead_letters_failed_at")
                    .table(BookingDeadLetters::Table)
                    .col(BookingDeadLetters::FailedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(BookingDeadLetters::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Bookings::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum Bookings {
    Table,
    Id,
    DedupId,
    GroupKey,
    BookingId,
    UserId,
    ServiceId,
    BookingTime,
    Payload,
    Status,
    CreatedAt,
}

#[derive(DeriveIden)]
enum BookingDeadLetters {
    Table,
    MessageId,
    DedupId,
    GroupKey,
    Payload,
    ReceiveCount,
    Reason,
    Error,
    FailedAt,
}
