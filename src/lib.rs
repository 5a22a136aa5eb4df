//! pghstore_rx: hstore parsing and serialization for Rust code running inside PostgreSQL.
//!
//! The hstore functions are acquired from the backend on first use. If the
//! server has not loaded the hstore library yet, the query in
//! `pghstore.probe_query` makes it do so and acquisition is retried once.

use pgrx::prelude::*;

pub mod codec;
pub mod error;
pub mod gucs;
pub mod loader;
pub mod provider;
pub mod session;
pub mod spi;
pub mod sql;

pub use codec::{HstoreCodec, HstoreMap};
pub use error::PghstoreError;
pub use session::{parse_hstore, serialize_hstore};

::pgrx::pg_module_magic!(name, version);

/// Extension initialization — registers GUCs.
#[pg_guard]
pub extern "C-unwind" fn _PG_init() {
    gucs::init_gucs();
}

/// Installs the contrib hstore extension and loads its library for a test;
/// false when the server does not ship it.
#[cfg(any(test, feature = "pg_test"))]
pub(crate) fn install_hstore() -> bool {
    let available = Spi::get_one::<bool>(
        "SELECT EXISTS (SELECT 1 FROM pg_available_extensions WHERE name = 'hstore')",
    )
    .expect("SPI failed")
    .unwrap_or(false);
    if available {
        Spi::run("CREATE EXTENSION IF NOT EXISTS hstore").expect("CREATE EXTENSION failed");
        Spi::run("LOAD 'hstore'").expect("LOAD failed");
    }
    available
}

/// This module is required by `cargo pgrx test` invocations.
/// It must be visible at the root of your extension crate.
#[cfg(test)]
pub mod pg_test {
    pub fn setup(_options: Vec<&str>) {
        // hstore is created up front so each test backend starts with the
        // type registered but its library not yet loaded; servers without
        // contrib skip the tests that need it
        if let Ok((mut client, _)) = pgrx_tests::client() {
            let _ = client.simple_query("CREATE EXTENSION IF NOT EXISTS hstore");
        }
    }

    #[must_use]
    pub fn postgresql_conf_options() -> Vec<&'static str> {
        // return any postgresql.conf settings that are required for your tests
        vec![]
    }
}
