//! GUC variables.

use std::ffi::{CStr, CString};

use pgrx::{GucContext, GucFlags, GucRegistry, GucSetting};

/// Default for `pghstore.probe_query`: any use of the type makes the server
/// load the hstore library.
pub const DEFAULT_PROBE_QUERY: &CStr = c"select '1=>1'::hstore";

/// GUC variable: `pghstore.probe_query` is run when the hstore functions
/// cannot be acquired, to make the server load the hstore library.
pub static PGHSTORE_PROBE_QUERY: GucSetting<Option<CString>> =
    GucSetting::<Option<CString>>::new(Some(DEFAULT_PROBE_QUERY));

/// Registers the GUC variables with PostgreSQL.
pub fn init_gucs() {
    GucRegistry::define_string_guc(
        c"pghstore.probe_query",
        c"Query run to force loading of the hstore library.",
        c"Runs only when the hstore functions cannot be acquired.",
        &PGHSTORE_PROBE_QUERY,
        GucContext::Userset,
        GucFlags::default(),
    );
}

/// Current probe query; an empty setting falls back to the default.
pub fn probe_query() -> String {
    PGHSTORE_PROBE_QUERY
        .get()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_PROBE_QUERY.to_string_lossy().into_owned())
}

#[cfg(any(test, feature = "pg_test"))]
#[pgrx::pg_schema]
mod tests {
    use pgrx::prelude::*;

    #[pg_test]
    fn test_probe_query_default() {
        let result = Spi::get_one::<String>("SHOW pghstore.probe_query")
            .expect("SPI failed")
            .expect("NULL result");
        assert_eq!(result, "select '1=>1'::hstore");
        assert_eq!(crate::gucs::probe_query(), "select '1=>1'::hstore");
    }

    #[pg_test]
    fn test_probe_query_set() {
        Spi::run("SET pghstore.probe_query = 'select ''a=>b''::public.hstore'").expect("SET failed");
        assert_eq!(crate::gucs::probe_query(), "select 'a=>b'::public.hstore");
    }

    #[pg_test]
    fn test_empty_setting_falls_back() {
        Spi::run("SET pghstore.probe_query = ''").expect("SET failed");
        assert_eq!(crate::gucs::probe_query(), "select '1=>1'::hstore");
    }
}
