// Core library utilities for the hypervisor

pub mod error;
pub mod printk;
pub mod panic;

// On the host every test thread presents as core 0, so the per-core
// recursive spinlocks do not serialize them; tests that touch global
// hypervisor state share this mutex instead.
#[cfg(test)]
pub fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}
