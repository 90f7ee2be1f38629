pub mod env {
    use once_cell::sync::Lazy;
    use parking_lot::{Mutex, MutexGuard};

    const PREFIX: &str = "FLOWSCOPE_";

    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    /// Exclusive access to the `FLOWSCOPE_*` environment for one test.
    ///
    /// Every such variable is cleared on construction and the original set is
    /// put back on drop, including removal of anything the test added.
    pub struct ScopedEnv {
        _lock: MutexGuard<'static, ()>,
        original: Vec<(String, String)>,
    }

    fn flowscope_vars() -> Vec<(String, String)> {
        std::env::vars()
            .filter(|(key, _)| key.starts_with(PREFIX))
            .collect()
    }

    pub fn isolated() -> ScopedEnv {
        let lock = ENV_LOCK.lock();
        let original = flowscope_vars();
        for (key, _) in &original {
            std::env::remove_var(key);
        }
        ScopedEnv {
            _lock: lock,
            original,
        }
    }

    impl ScopedEnv {
        pub fn set(&mut self, key: &str, value: &str) {
            assert!(key.starts_with(PREFIX), "{key} is outside the scoped env");
            std::env::set_var(key, value);
        }

        pub fn remove(&mut self, key: &str) {
            std::env::remove_var(key);
        }
    }

    impl Drop for ScopedEnv {
        fn drop(&mut self) {
            for (key, _) in flowscope_vars() {
                std::env::remove_var(key);
            }
            for (key, value) in self.original.drain(..) {
                std::env::set_var(key, value);
            }
        }
    }
}
