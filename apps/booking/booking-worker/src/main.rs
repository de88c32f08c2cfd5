//! Booking Worker Service - Entry Point
//!
//! Background worker that persists booking requests from the FIFO queue.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    booking_worker::run().await
}
