//! The host capability backed by SPI.

use std::panic::AssertUnwindSafe;

use pgrx::pg_sys;
use pgrx::pg_sys::panic::CaughtError;
use pgrx::prelude::*;
use pgrx::PgTryBuilder;

use crate::error::ExecuteError;
use crate::loader::Host;

/// Runs queries against the current backend session.
#[derive(Debug, Clone, Copy)]
pub struct SpiHost {
    _private: (),
}

impl SpiHost {
    /// Returns a host when the backend is inside a transaction, where SPI can
    /// run queries. Outside of one (e.g. while the library is being loaded by
    /// the postmaster) there is no session to talk to.
    pub fn current() -> Option<Self> {
        // SAFETY: reads backend-local transaction state.
        let in_transaction = unsafe { pg_sys::IsTransactionState() };
        in_transaction.then_some(Self { _private: () })
    }
}

impl Host for SpiHost {
    fn execute(&self, query: &str) -> Result<(), ExecuteError> {
        pgrx::debug1!("pghstore: running \"{}\"", query);
        let result = subtransaction(|| Spi::run(query))
            .and_then(|r| r.map_err(|e| e.to_string()));
        if let Err(message) = &result {
            pgrx::debug1!("pghstore: \"{}\" failed: {}", query, message);
        }
        result.map_err(|message| ExecuteError {
            query: query.to_string(),
            message,
        })
    }
}

/// Runs `f` in an internal subtransaction.
///
/// A PostgreSQL ERROR raised inside `f` rolls the subtransaction back and is
/// returned as its message; the caller's transaction stays usable. A Rust
/// panic also rolls the subtransaction back, then keeps unwinding.
pub fn subtransaction<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    // SAFETY: the memory context and resource owner are restored on both paths.
    unsafe {
        let old_context = pg_sys::CurrentMemoryContext;
        let old_owner = pg_sys::CurrentResourceOwner;

        pg_sys::BeginInternalSubTransaction(std::ptr::null());
        pg_sys::MemoryContextSwitchTo(old_context);

        PgTryBuilder::new(AssertUnwindSafe(|| {
            let value = f();
            pg_sys::ReleaseCurrentSubTransaction();
            pg_sys::MemoryContextSwitchTo(old_context);
            pg_sys::CurrentResourceOwner = old_owner;
            Ok(value)
        }))
        .catch_others(|error| {
            pg_sys::RollbackAndReleaseCurrentSubTransaction();
            pg_sys::MemoryContextSwitchTo(old_context);
            pg_sys::CurrentResourceOwner = old_owner;
            match error {
                CaughtError::PostgresError(report) | CaughtError::ErrorReport(report) => {
                    Err(report.message().to_string())
                }
                other @ CaughtError::RustPanic { .. } => other.rethrow(),
            }
        })
        .execute()
    }
}

#[cfg(any(test, feature = "pg_test"))]
#[pgrx::pg_schema]
mod tests {
    use pgrx::prelude::*;

    use crate::loader::Host;
    use crate::spi::{subtransaction, SpiHost};

    #[pg_test]
    fn test_host_available_in_transaction() {
        assert!(SpiHost::current().is_some());
    }

    #[pg_test]
    fn test_execute_ok() {
        let host = SpiHost::current().expect("no host");
        assert_eq!(host.execute("SELECT 1"), Ok(()));
    }

    #[pg_test]
    fn test_execute_error_keeps_transaction_usable() {
        let host = SpiHost::current().expect("no host");
        let err = host
            .execute("SELECT 'x'::no_such_type_pghstore")
            .unwrap_err();
        assert_eq!(err.query, "SELECT 'x'::no_such_type_pghstore");
        assert!(err.message.contains("no_such_type_pghstore"));

        let result = Spi::get_one::<i32>("SELECT 42")
            .expect("SPI failed")
            .expect("NULL result");
        assert_eq!(result, 42);
    }

    #[pg_test]
    fn test_subtransaction_rolls_back_on_error() {
        Spi::run("CREATE TABLE pghstore_subxact (id int)").unwrap();
        let result = subtransaction(|| {
            Spi::run("INSERT INTO pghstore_subxact VALUES (1)").unwrap();
            Spi::run("SELECT 1/0").ok();
        });
        assert!(result.unwrap_err().contains("division by zero"));

        let count = Spi::get_one::<i64>("SELECT count(*) FROM pghstore_subxact")
            .expect("SPI failed")
            .expect("NULL count");
        assert_eq!(count, 0);
    }

    #[pg_test]
    fn test_subtransaction_commits_on_success() {
        Spi::run("CREATE TABLE pghstore_subxact_ok (id int)").unwrap();
        let result = subtransaction(|| Spi::run("INSERT INTO pghstore_subxact_ok VALUES (1)"));
        assert!(matches!(result, Ok(Ok(()))));

        let count = Spi::get_one::<i64>("SELECT count(*) FROM pghstore_subxact_ok")
            .expect("SPI failed")
            .expect("NULL count");
        assert_eq!(count, 1);
    }

    #[pg_test]
    #[should_panic(expected = "bug inside subtransaction")]
    fn test_subtransaction_propagates_rust_panic() {
        let _ = subtransaction(|| -> i32 { panic!("bug inside subtransaction") });
    }
}
