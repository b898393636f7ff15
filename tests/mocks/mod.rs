mod mock_cache;
pub use self::mock_cache::MockCache;
