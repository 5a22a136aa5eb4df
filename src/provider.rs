//! hstore capabilities resolved from the current backend.
//!
//! The hstore C functions are looked up among the symbols already loaded into
//! the process, never loaded on demand. Until the server has loaded the hstore
//! library in this backend (which happens the first time the type is used),
//! acquisition fails.

use std::ffi::{c_char, c_void, CStr, CString};

use pgrx::pg_sys;
use pgrx::prelude::*;

use crate::codec::{split_pairs, validate_pairs, zip_pairs, HstoreCodec, HstoreMap};
use crate::error::{AcquisitionError, CodecError};
use crate::loader::CapabilityProvider;
use crate::spi::subtransaction;

type PgFunction = unsafe extern "C-unwind" fn(pg_sys::FunctionCallInfo) -> pg_sys::Datum;

// dlsym handle searching every library loaded with RTLD_GLOBAL, which is how
// the server loads extension libraries.
#[cfg(target_os = "macos")]
const RTLD_DEFAULT: *mut c_void = -2isize as *mut c_void;
#[cfg(not(target_os = "macos"))]
const RTLD_DEFAULT: *mut c_void = std::ptr::null_mut();

fn lookup(name: &CStr) -> Result<PgFunction, AcquisitionError> {
    // SAFETY: only reads the dynamic linker's symbol tables.
    let function = unsafe { pg_sys::lookup_external_function(RTLD_DEFAULT, name.as_ptr()) };
    function.ok_or_else(|| {
        AcquisitionError::new(format!(
            "symbol {} not found, the hstore library is not loaded in this backend",
            name.to_string_lossy()
        ))
    })
}

/// Whether the hstore library is loaded in this backend.
pub fn library_loaded() -> bool {
    lookup(c"hstore_in").is_ok()
}

/// Resolves the hstore functions from the already loaded hstore library.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionProvider;

impl CapabilityProvider for SessionProvider {
    type Codec = SessionCodec;

    fn acquire(&self) -> Result<SessionCodec, AcquisitionError> {
        let codec = SessionCodec {
            hstore_in: lookup(c"hstore_in")?,
            hstore_out: lookup(c"hstore_out")?,
            akeys: lookup(c"hstore_akeys")?,
            avals: lookup(c"hstore_avals")?,
            from_arrays: lookup(c"hstore_from_arrays")?,
        };
        pgrx::debug1!("pghstore: acquired hstore functions");
        Ok(codec)
    }
}

/// Parse and serialize by calling the hstore library directly.
#[derive(Debug, Clone, Copy)]
pub struct SessionCodec {
    hstore_in: PgFunction,
    hstore_out: PgFunction,
    akeys: PgFunction,
    avals: PgFunction,
    from_arrays: PgFunction,
}

/// Calls a V1 function with no collation. Arguments must match what `f` expects.
unsafe fn call1(f: PgFunction, arg: pg_sys::Datum) -> pg_sys::Datum {
    pg_sys::DirectFunctionCall1Coll(Some(f), pg_sys::InvalidOid, arg)
}

/// Two-argument form of [`call1`].
unsafe fn call2(f: PgFunction, arg1: pg_sys::Datum, arg2: pg_sys::Datum) -> pg_sys::Datum {
    pg_sys::DirectFunctionCall2Coll(Some(f), pg_sys::InvalidOid, arg1, arg2)
}

impl SessionCodec {
    fn parse(&self, text: &str) -> Result<HstoreMap, CodecError> {
        let text = CString::new(text).map_err(|_| CodecError::NulByte { what: "text" })?;
        let arrays = subtransaction(|| {
            // SAFETY: hstore_in takes a cstring and copies it; akeys/avals take
            // the hstore it returns and build text[] arrays in the current
            // memory context.
            unsafe {
                let hstore = call1(self.hstore_in, pg_sys::Datum::from(text.as_ptr().cast_mut()));
                let keys = Vec::<String>::from_datum(call1(self.akeys, hstore), false);
                let values = Vec::<Option<String>>::from_datum(call1(self.avals, hstore), false);
                (keys.unwrap_or_default(), values.unwrap_or_default())
            }
        })
        .map_err(CodecError::Host)?;
        zip_pairs(arrays.0, arrays.1)
    }

    fn serialize(&self, map: &HstoreMap) -> Result<String, CodecError> {
        validate_pairs(map)?;
        let (keys, values) = split_pairs(map);
        subtransaction(|| {
            let keys = keys.into_datum().unwrap_or_else(|| pgrx::error!("could not build key array"));
            let values = values
                .into_datum()
                .unwrap_or_else(|| pgrx::error!("could not build value array"));
            // SAFETY: hstore_from_arrays takes two text[] datums and returns an
            // hstore, which hstore_out turns into a palloc'd cstring.
            unsafe {
                let hstore = call2(self.from_arrays, keys, values);
                let text = call1(self.hstore_out, hstore);
                CStr::from_ptr(text.cast_mut_ptr::<c_char>())
                    .to_string_lossy()
                    .into_owned()
            }
        })
        .map_err(CodecError::Host)
    }
}

impl HstoreCodec for SessionCodec {
    fn parse_hstore(&self, text: Option<&str>) -> Result<Option<HstoreMap>, CodecError> {
        text.map(|t| self.parse(t)).transpose()
    }

    fn serialize_hstore(&self, map: Option<&HstoreMap>) -> Result<Option<String>, CodecError> {
        map.map(|m| self.serialize(m)).transpose()
    }
}

#[cfg(any(test, feature = "pg_test"))]
#[pgrx::pg_schema]
mod tests {
    use std::cell::Cell;

    use pgrx::prelude::*;

    use crate::codec::{HstoreCodec, HstoreMap};
    use crate::error::{CodecError, ExecuteError};
    use crate::gucs;
    use crate::install_hstore;
    use crate::loader::{CapabilityProvider, Host, Loader};
    use crate::provider::{library_loaded, SessionProvider};
    use crate::spi::SpiHost;

    struct CountingHost {
        inner: SpiHost,
        runs: Cell<usize>,
    }

    impl Host for CountingHost {
        fn execute(&self, query: &str) -> Result<(), ExecuteError> {
            self.runs.set(self.runs.get() + 1);
            self.inner.execute(query)
        }
    }

    fn hstore_created() -> bool {
        Spi::get_one::<bool>("SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = 'hstore')")
            .expect("SPI failed")
            .unwrap_or(false)
    }

    #[pg_test]
    fn test_acquire_fails_until_library_loaded() {
        if library_loaded() {
            return;
        }
        let err = SessionProvider.acquire().unwrap_err();
        assert_eq!(
            err.reason(),
            "symbol hstore_in not found, the hstore library is not loaded in this backend"
        );
    }

    #[pg_test]
    fn test_first_use_loads_library() {
        // needs hstore created in the database but not yet used by this backend
        if !hstore_created() || library_loaded() {
            return;
        }
        assert!(SessionProvider.acquire().is_err());

        let loader = Loader::new("pghstore_rx", SessionProvider);
        let host = CountingHost {
            inner: SpiHost::current().expect("no host"),
            runs: Cell::new(0),
        };
        let codec = loader
            .load(Some(&host), &gucs::probe_query())
            .expect("load failed");
        assert_eq!(host.runs.get(), 1);
        assert!(library_loaded());
        assert_eq!(
            codec.parse_hstore(Some("a=>1")).unwrap(),
            Some(HstoreMap::from([("a".to_string(), Some("1".to_string()))]))
        );

        loader.load(Some(&host), &gucs::probe_query()).unwrap();
        assert_eq!(host.runs.get(), 1);
    }

    #[pg_test]
    fn test_parse_and_serialize() {
        if !install_hstore() {
            return;
        }
        let codec = SessionProvider.acquire().expect("acquire failed");

        let map = codec
            .parse_hstore(Some(r#""a"=>"1", "b"=>NULL"#))
            .unwrap()
            .unwrap();
        assert_eq!(
            map,
            HstoreMap::from([
                ("a".to_string(), Some("1".to_string())),
                ("b".to_string(), None),
            ])
        );

        let text = codec.serialize_hstore(Some(&map)).unwrap().unwrap();
        assert_eq!(text, r#""a"=>"1", "b"=>NULL"#);
    }

    #[pg_test]
    fn test_empty() {
        if !install_hstore() {
            return;
        }
        let codec = SessionProvider.acquire().expect("acquire failed");
        assert_eq!(
            codec.serialize_hstore(Some(&HstoreMap::new())),
            Ok(Some(String::new()))
        );
        assert_eq!(codec.parse_hstore(Some("")), Ok(Some(HstoreMap::new())));
    }

    #[pg_test]
    fn test_null_passes_through() {
        if !install_hstore() {
            return;
        }
        let codec = SessionProvider.acquire().expect("acquire failed");
        assert_eq!(codec.parse_hstore(None), Ok(None));
        assert_eq!(codec.serialize_hstore(None), Ok(None));
    }

    #[pg_test]
    fn test_parse_syntax_error() {
        if !install_hstore() {
            return;
        }
        let codec = SessionProvider.acquire().expect("acquire failed");
        let err = codec.parse_hstore(Some("a=>")).unwrap_err();
        assert!(matches!(err, CodecError::Host(ref m) if m.contains("hstore")));

        // the failed parse leaves the transaction usable
        assert_eq!(
            codec.parse_hstore(Some("x=>y")).unwrap().unwrap().len(),
            1
        );
    }

    #[pg_test]
    fn test_nul_bytes_rejected() {
        if !install_hstore() {
            return;
        }
        let codec = SessionProvider.acquire().expect("acquire failed");
        let map = HstoreMap::from([("a\0".to_string(), None)]);
        assert_eq!(
            codec.serialize_hstore(Some(&map)),
            Err(CodecError::NulByte { what: "keys" })
        );
        assert_eq!(
            codec.parse_hstore(Some("a=>\0")),
            Err(CodecError::NulByte { what: "text" })
        );
    }
}
