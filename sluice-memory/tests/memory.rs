#[cfg(test)]
mod tests {
    use sluice_memory::MemoryDriver;
    use sluice_tests::{execute_tests, init_logs};
    use std::sync::Mutex;

    static MUTEX: Mutex<()> = Mutex::new(());

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn memory() {
        init_logs();
        let _guard = MUTEX.lock().unwrap();
        execute_tests(MemoryDriver::new(), "memory://tests").await;
    }

    #[tokio::test]
    async fn memory_single_thread() {
        init_logs();
        let _guard = MUTEX.lock().unwrap();
        execute_tests(MemoryDriver::new(), "memory://single-thread").await;
    }
}
