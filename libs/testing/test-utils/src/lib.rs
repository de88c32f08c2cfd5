//! Shared test utilities
//!
//! - `TestDatabase`: PostgreSQL container with migrations applied and
//!   automatic cleanup (feature: "postgres")
//! - `TestDataBuilder`: Deterministic test data generation (always available)
//! - `assertions`: Custom assertion helpers (always available)
//!
//! # Usage
//!
//! ```rust,no_run
//! use test_utils::{TestDatabase, TestDataBuilder};
//!
//! #[tokio::test]
//! async fn my_postgres_test() {
//!     let db = TestDatabase::new().await;
//!     let builder = TestDataBuilder::from_test_name("my_test");
//!
//!     let booking_id = builder.booking_id(0);
//!     let group = builder.group_key(3);
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "postgres")]
mod postgres;

#[cfg(feature = "postgres")]
pub use postgres::TestDatabase;

/// Builder for test data with deterministic randomization
///
/// This ensures tests are reproducible by using seeded data.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_pipeline");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// The `index`-th booking id of this builder
    pub fn booking_id(&self, index: u64) -> Uuid {
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[..8].copy_from_slice(&self.seed.to_le_bytes());
        uuid_bytes[8..16].copy_from_slice(&index.to_le_bytes());
        Uuid::from_bytes(uuid_bytes)
    }

    /// Message group name, e.g. `"test-group-12345-3"`
    pub fn group_key(&self, index: usize) -> String {
        self.name("group", &index.to_string())
    }

    /// Generate a unique name for testing
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("my_test");
    /// let name = builder.name("user", "main");
    /// // Returns: "test-user-12345-main"
    /// ```
    pub fn name(&self, prefix: &str, suffix: &str) -> String {
        format!("test-{}-{}-{}", prefix, self.seed, suffix)
    }
}

/// Test assertion helpers
pub mod assertions {
    /// Assert that `values` is sorted ascending, with the first violation in the message
    pub fn assert_ascending<T: PartialOrd + std::fmt::Debug>(values: &[T], context: &str) {
        if let Some(pos) = values.windows(2).position(|w| w[0] > w[1]) {
            panic!(
                "{}: out of order at index {}: {:?} > {:?}",
                context,
                pos + 1,
                values[pos],
                values[pos + 1]
            );
        }
    }

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_builder_deterministic() {
        let builder1 = TestDataBuilder::new(42);
        let builder2 = TestDataBuilder::new(42);

        assert_eq!(builder1.booking_id(7), builder2.booking_id(7));
        assert_eq!(builder1.group_key(1), builder2.group_key(1));
    }

    #[test]
    fn test_booking_ids_are_distinct_per_index() {
        let builder = TestDataBuilder::from_test_name("my_test");
        assert_ne!(builder.booking_id(0), builder.booking_id(1));
    }

    #[test]
    fn test_data_builder_different_names() {
        let builder1 = TestDataBuilder::from_test_name("test1");
        let builder2 = TestDataBuilder::from_test_name("test2");

        assert_ne!(builder1.booking_id(0), builder2.booking_id(0));
    }

    #[test]
    #[should_panic(expected = "out of order at index 2")]
    fn test_assert_ascending_reports_position() {
        assertions::assert_ascending(&[1, 2, 1], "seq");
    }
}
