use std::panic;
use std::sync::Arc;
use std::sync::mpsc::channel;

use anyhow::Result;
use scoped_thread_pool::Pool;

/// Execute function inside thread pool and return its result. A
/// panic in `f` is resumed in the calling thread.
pub fn in_threadpool<F, R>(threadpool: Arc<Pool>, f: F) -> Result<R>
where F: FnOnce() -> R + Send,
      R: Send
{
    let (tx, rx) = channel();
    let result = threadpool.scoped(move |scope| {
        scope.execute(move || {
            // As in rouille: unwinding is always resumed afterwards,
            // so the panic-safety mechanism of `catch_unwind` can be
            // ignored.
            let result = panic::catch_unwind(panic::AssertUnwindSafe(f));
            // The receiver only goes away if the caller panicked
            let _ = tx.send(result);
        });
        rx.recv()
    })?;
    match result {
        Ok(r) => Ok(r),
        Err(payload) => panic::resume_unwind(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_in_threadpool() -> Result<()> {
        let pool = Arc::new(Pool::new(2));
        let caller = std::thread::current().id();
        let data = vec![1, 2, 3];
        let (sum, thread) = in_threadpool(pool.clone(), || {
            (data.iter().sum::<i32>(), std::thread::current().id())
        })?;
        assert_eq!(sum, 6);
        assert_ne!(thread, caller);

        let caught = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            in_threadpool(pool.clone(), || -> i32 { panic!("boom") })
        }));
        assert!(caught.is_err());
        // the pool still works afterwards
        assert_eq!(in_threadpool(pool, || 7)?, 7);
        Ok(())
    }
}
