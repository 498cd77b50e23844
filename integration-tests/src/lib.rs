// Intentionally empty: this crate only carries integration tests.
