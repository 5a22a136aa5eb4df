//! SQL-callable functions.

use pgrx::prelude::*;

use crate::codec::zip_pairs;
use crate::session;

/// Parses hstore text into `(key, value)` rows. NULL input yields no rows.
#[pg_extern]
fn pghstore_parse(
    text: Option<&str>,
) -> TableIterator<'static, (name!(key, String), name!(value, Option<String>))> {
    let map = match session::parse_hstore(text) {
        Ok(map) => map.unwrap_or_default(),
        Err(e) => pgrx::error!("{}", e),
    };
    TableIterator::new(map)
}

/// Serializes parallel key and value arrays into hstore text.
#[pg_extern]
fn pghstore_serialize(keys: Vec<Option<String>>, values: Vec<Option<String>>) -> Option<String> {
    if keys.iter().any(Option::is_none) {
        pgrx::error!("hstore keys cannot be NULL");
    }
    let keys = keys.into_iter().flatten().collect();
    let map = match zip_pairs(keys, values) {
        Ok(map) => map,
        Err(e) => pgrx::error!("{}", e),
    };
    match session::serialize_hstore(Some(&map)) {
        Ok(text) => text,
        Err(e) => pgrx::error!("{}", e),
    }
}

/// Whether the hstore functions have been acquired in this backend.
#[pg_extern]
fn pghstore_loaded() -> bool {
    session::is_loaded()
}

#[pg_extern]
fn pghstore_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(any(test, feature = "pg_test"))]
#[pgrx::pg_schema]
mod tests {
    use pgrx::prelude::*;

    use crate::install_hstore;

    #[pg_test]
    fn test_version() {
        let result = Spi::get_one::<String>("SELECT pghstore_version()")
            .expect("SPI failed")
            .expect("NULL result");
        assert_eq!(result, env!("CARGO_PKG_VERSION"));
    }

    #[pg_test]
    fn test_not_loaded_initially() {
        let loaded = Spi::get_one::<bool>("SELECT pghstore_loaded()")
            .expect("SPI failed")
            .expect("NULL result");
        assert!(!loaded);
    }

    #[pg_test]
    #[should_panic(expected = "the hstore library is not loaded in this backend")]
    fn test_parse_without_hstore() {
        Spi::run("SET pghstore.probe_query = 'select 1/0'").unwrap();
        Spi::get_one::<i64>("SELECT count(*) FROM pghstore_parse('a=>1')").ok();
    }

    #[pg_test]
    fn test_parse_rows() {
        if !install_hstore() {
            return;
        }
        let count = Spi::get_one::<i64>(
            "SELECT count(*) FROM pghstore_parse('a=>1, b=>NULL, c=>3') WHERE value IS NOT NULL",
        )
        .expect("SPI failed")
        .expect("NULL count");
        assert_eq!(count, 2);

        let value = Spi::get_one::<String>("SELECT value FROM pghstore_parse('a=>1') WHERE key = 'a'")
            .expect("SPI failed")
            .expect("NULL value");
        assert_eq!(value, "1");
    }

    #[pg_test]
    fn test_parse_null() {
        if !install_hstore() {
            return;
        }
        let count = Spi::get_one::<i64>("SELECT count(*) FROM pghstore_parse(NULL)")
            .expect("SPI failed")
            .expect("NULL count");
        assert_eq!(count, 0);
    }

    #[pg_test]
    fn test_serialize() {
        if !install_hstore() {
            return;
        }
        let result = Spi::get_one::<String>(
            "SELECT pghstore_serialize(ARRAY['b', 'a'], ARRAY[NULL, '1'])",
        )
        .expect("SPI failed")
        .expect("NULL result");
        assert_eq!(result, r#""a"=>"1", "b"=>NULL"#);

        let loaded = Spi::get_one::<bool>("SELECT pghstore_loaded()")
            .expect("SPI failed")
            .expect("NULL result");
        assert!(loaded);
    }

    #[pg_test]
    #[should_panic(expected = "arrays must have same bounds")]
    fn test_serialize_mismatched() {
        Spi::get_one::<String>("SELECT pghstore_serialize(ARRAY['a'], ARRAY[]::text[])").ok();
    }

    #[pg_test]
    #[should_panic(expected = "hstore keys cannot be NULL")]
    fn test_serialize_null_key() {
        Spi::get_one::<String>("SELECT pghstore_serialize(ARRAY[NULL]::text[], ARRAY['1'])").ok();
    }
}
