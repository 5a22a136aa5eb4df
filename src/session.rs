//! The backend-wide loader and the functions it hands out.

use crate::codec::{HstoreCodec, HstoreMap};
use crate::error::PghstoreError;
use crate::gucs;
use crate::loader::{Host, Loader};
use crate::provider::{SessionCodec, SessionProvider};
use crate::spi::SpiHost;

/// Name reported when the functions are used outside a backend session.
pub const MODULE_NAME: &str = env!("CARGO_PKG_NAME");

thread_local! {
    // Backends are single-threaded; one loader per process.
    static LOADER: Loader<SessionProvider> = const { Loader::new(MODULE_NAME, SessionProvider) };
}

/// Runs `f` with the session's hstore functions, loading them first if needed.
pub fn with_codec<R>(
    f: impl FnOnce(&SessionCodec) -> Result<R, PghstoreError>,
) -> Result<R, PghstoreError> {
    LOADER.with(|loader| {
        let was_loaded = loader.is_loaded();
        let host = SpiHost::current();
        let codec = loader.load(host.as_ref().map(|h| h as &dyn Host), &gucs::probe_query())?;
        if !was_loaded {
            pgrx::debug1!("pghstore: {} loaded", loader.module());
        }
        f(codec)
    })
}

/// Whether the hstore functions have been acquired in this backend.
pub fn is_loaded() -> bool {
    LOADER.with(|loader| loader.is_loaded())
}

/// Parses the text representation of an hstore into a map.
pub fn parse_hstore(text: Option<&str>) -> Result<Option<HstoreMap>, PghstoreError> {
    with_codec(|codec| Ok(codec.parse_hstore(text)?))
}

/// Serializes a map into the text representation of an hstore.
pub fn serialize_hstore(map: Option<&HstoreMap>) -> Result<Option<String>, PghstoreError> {
    with_codec(|codec| Ok(codec.serialize_hstore(map)?))
}

#[cfg(any(test, feature = "pg_test"))]
#[pgrx::pg_schema]
mod tests {
    use pgrx::prelude::*;

    use crate::codec::HstoreMap;
    use crate::error::{LoadError, PghstoreError};
    use crate::install_hstore;
    use crate::provider::library_loaded;
    use crate::session::{is_loaded, parse_hstore, serialize_hstore};

    #[pg_test]
    fn test_failed_load_reports_acquisition_error() {
        if library_loaded() {
            return;
        }
        Spi::run("SET pghstore.probe_query = 'select 1/0'").unwrap();

        let err = parse_hstore(Some("a=>1")).unwrap_err();
        match err {
            PghstoreError::Load(LoadError::Acquisition(e)) => {
                assert_eq!(
                    e.reason(),
                    "symbol hstore_in not found, the hstore library is not loaded in this backend"
                );
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!is_loaded());

        // the failed query did not abort the transaction
        let one = Spi::get_one::<i32>("SELECT 1")
            .expect("SPI failed")
            .expect("NULL result");
        assert_eq!(one, 1);
    }

    #[pg_test]
    fn test_loads_once() {
        if !install_hstore() {
            return;
        }
        let map = parse_hstore(Some("k=>v")).unwrap().unwrap();
        assert_eq!(map, HstoreMap::from([("k".to_string(), Some("v".to_string()))]));
        assert!(is_loaded());

        // cached functions are reused without running the query again
        Spi::run("SET pghstore.probe_query = 'select 1/0'").unwrap();
        assert_eq!(
            serialize_hstore(Some(&map)).unwrap(),
            Some(r#""k"=>"v""#.to_string())
        );
        assert_eq!(serialize_hstore(None).unwrap(), None);
    }
}
