//! Acquisition of the hstore capabilities, with a probe-and-retry fallback.
//!
//! The provider may be unable to hand out its functions until the host has
//! loaded the hstore library in the current session. When the first
//! acquisition fails, the loader runs a probe query through the host to force
//! that load and tries exactly once more.

use std::cell::OnceCell;

use crate::codec::HstoreCodec;
use crate::error::{AcquisitionError, ExecuteError, LoadError};

/// Query execution against the current session.
pub trait Host {
    fn execute(&self, query: &str) -> Result<(), ExecuteError>;
}

/// Source of the hstore capabilities.
pub trait CapabilityProvider {
    type Codec: HstoreCodec;

    fn acquire(&self) -> Result<Self::Codec, AcquisitionError>;
}

/// Loads the capability bundle once and hands it out afterwards.
pub struct Loader<P: CapabilityProvider> {
    module: &'static str,
    provider: P,
    loaded: OnceCell<P::Codec>,
}

impl<P: CapabilityProvider> Loader<P> {
    pub const fn new(module: &'static str, provider: P) -> Self {
        Self {
            module,
            provider,
            loaded: OnceCell::new(),
        }
    }

    /// Returns the capability bundle, acquiring it on first success.
    ///
    /// `host` is `None` when the caller is not running inside the host; that
    /// fails before the provider is consulted. If acquisition fails, the probe
    /// query runs once. A failed probe reports the original acquisition error;
    /// a successful one is followed by a single retry whose result is final.
    ///
    /// Once a bundle is cached, later calls return it without touching the
    /// host or the provider.
    pub fn load(
        &self,
        host: Option<&dyn Host>,
        probe_query: &str,
    ) -> Result<&P::Codec, LoadError> {
        if let Some(codec) = self.loaded.get() {
            return Ok(codec);
        }

        let host = host.ok_or(LoadError::HostContextMissing {
            module: self.module,
        })?;

        let codec = match self.provider.acquire() {
            Ok(codec) => codec,
            Err(original) => {
                if host.execute(probe_query).is_err() {
                    return Err(original.into());
                }
                self.provider.acquire()?
            }
        };

        Ok(self.loaded.get_or_init(|| codec))
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.get().is_some()
    }

    pub fn module(&self) -> &'static str {
        self.module
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    use super::*;
    use crate::codec::HstoreMap;
    use crate::error::CodecError;

    const PROBE: &str = "select '1=>1'::hstore";

    #[derive(Debug, PartialEq)]
    struct FakeCodec(u32);

    impl HstoreCodec for FakeCodec {
        fn parse_hstore(&self, text: Option<&str>) -> Result<Option<HstoreMap>, CodecError> {
            Ok(text.map(|t| {
                HstoreMap::from([(t.to_string(), Some(self.0.to_string()))])
            }))
        }

        fn serialize_hstore(
            &self,
            map: Option<&HstoreMap>,
        ) -> Result<Option<String>, CodecError> {
            Ok(map.map(|m| format!("{} pairs", m.len())))
        }
    }

    /// Hands out scripted acquisition results in order.
    struct ScriptedProvider {
        results: RefCell<VecDeque<Result<FakeCodec, AcquisitionError>>>,
        calls: Cell<usize>,
    }

    impl ScriptedProvider {
        fn new(results: Vec<Result<FakeCodec, AcquisitionError>>) -> Self {
            Self {
                results: RefCell::new(results.into()),
                calls: Cell::new(0),
            }
        }
    }

    impl CapabilityProvider for ScriptedProvider {
        type Codec = FakeCodec;

        fn acquire(&self) -> Result<FakeCodec, AcquisitionError> {
            self.calls.set(self.calls.get() + 1);
            self.results
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err(AcquisitionError::new("script exhausted")))
        }
    }

    struct RecordingHost {
        fail: bool,
        queries: RefCell<Vec<String>>,
    }

    impl RecordingHost {
        fn new(fail: bool) -> Self {
            Self {
                fail,
                queries: RefCell::new(Vec::new()),
            }
        }
    }

    impl Host for RecordingHost {
        fn execute(&self, query: &str) -> Result<(), ExecuteError> {
            self.queries.borrow_mut().push(query.to_string());
            if self.fail {
                Err(ExecuteError {
                    query: query.to_string(),
                    message: "type \"hstore\" does not exist".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn missing() -> AcquisitionError {
        AcquisitionError::new("undefined symbol: hstore_in")
    }

    #[test]
    fn test_load_direct() {
        let loader = Loader::new("pghstore_rx", ScriptedProvider::new(vec![Ok(FakeCodec(1))]));
        let host = RecordingHost::new(false);

        let codec = loader.load(Some(&host), PROBE).unwrap();
        assert_eq!(
            codec.parse_hstore(Some("a")).unwrap(),
            Some(HstoreMap::from([("a".to_string(), Some("1".to_string()))]))
        );
        assert_eq!(
            codec.serialize_hstore(Some(&HstoreMap::new())).unwrap(),
            Some("0 pairs".to_string())
        );
        assert!(host.queries.borrow().is_empty());
        assert_eq!(loader.provider().calls.get(), 1);
    }

    #[test]
    fn test_load_without_host() {
        let loader = Loader::new("pghstore_rx", ScriptedProvider::new(vec![Ok(FakeCodec(1))]));

        let err = loader.load(None, PROBE).unwrap_err();
        assert_eq!(
            err,
            LoadError::HostContextMissing {
                module: "pghstore_rx"
            }
        );
        assert!(err.to_string().contains("pghstore_rx"));
        assert_eq!(loader.provider().calls.get(), 0);
        assert!(!loader.is_loaded());
    }

    #[test]
    fn test_probe_then_retry() {
        let loader = Loader::new(
            "pghstore_rx",
            ScriptedProvider::new(vec![Err(missing()), Ok(FakeCodec(2))]),
        );
        let host = RecordingHost::new(false);

        let codec = loader.load(Some(&host), PROBE).unwrap();
        assert_eq!(codec, &FakeCodec(2));
        assert_eq!(*host.queries.borrow(), vec![PROBE.to_string()]);
        assert_eq!(loader.provider().calls.get(), 2);
    }

    #[test]
    fn test_failed_probe_reports_original_error() {
        let loader = Loader::new(
            "pghstore_rx",
            ScriptedProvider::new(vec![Err(missing()), Ok(FakeCodec(2))]),
        );
        let host = RecordingHost::new(true);

        let err = loader.load(Some(&host), PROBE).unwrap_err();
        assert_eq!(err, LoadError::Acquisition(missing()));
        assert!(!err.to_string().contains("does not exist"));
        // no retry after a failed probe
        assert_eq!(loader.provider().calls.get(), 1);
        assert!(!loader.is_loaded());
    }

    #[test]
    fn test_retry_failure_is_final() {
        let loader = Loader::new(
            "pghstore_rx",
            ScriptedProvider::new(vec![
                Err(missing()),
                Err(AcquisitionError::new("still missing")),
                Ok(FakeCodec(3)),
            ]),
        );
        let host = RecordingHost::new(false);

        let err = loader.load(Some(&host), PROBE).unwrap_err();
        assert_eq!(
            err,
            LoadError::Acquisition(AcquisitionError::new("still missing"))
        );
        assert_eq!(host.queries.borrow().len(), 1);
        assert_eq!(loader.provider().calls.get(), 2);
    }

    #[test]
    fn test_reload_is_idempotent() {
        let loader = Loader::new(
            "pghstore_rx",
            ScriptedProvider::new(vec![Err(missing()), Ok(FakeCodec(4))]),
        );
        let host = RecordingHost::new(false);

        loader.load(Some(&host), PROBE).unwrap();
        let again = loader.load(Some(&host), PROBE).unwrap();
        assert_eq!(again, &FakeCodec(4));
        // cached bundle is returned even without a host
        assert_eq!(loader.load(None, PROBE).unwrap(), &FakeCodec(4));

        assert_eq!(host.queries.borrow().len(), 1);
        assert_eq!(loader.provider().calls.get(), 2);
        assert!(loader.is_loaded());
    }

    #[test]
    fn test_failure_is_not_cached() {
        let loader = Loader::new(
            "pghstore_rx",
            ScriptedProvider::new(vec![Err(missing()), Ok(FakeCodec(5))]),
        );

        let failing = RecordingHost::new(true);
        assert!(loader.load(Some(&failing), PROBE).is_err());

        let host = RecordingHost::new(false);
        assert_eq!(loader.load(Some(&host), PROBE).unwrap(), &FakeCodec(5));
        assert!(host.queries.borrow().is_empty());
    }

    #[test]
    fn test_custom_probe_query() {
        let loader = Loader::new(
            "pghstore_rx",
            ScriptedProvider::new(vec![Err(missing()), Ok(FakeCodec(6))]),
        );
        let host = RecordingHost::new(false);

        loader
            .load(Some(&host), "select 'a=>b'::public.hstore")
            .unwrap();
        assert_eq!(
            *host.queries.borrow(),
            vec!["select 'a=>b'::public.hstore".to_string()]
        );
    }
}
