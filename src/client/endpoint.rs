/*
 * Copyright 2024-2025 the redis-steward developers
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Where and how to connect.

use std::time::Duration;

use url::Url;

use crate::error::Error;

pub(crate) const DEFAULT_PORT: u16 = 6379;
pub(crate) const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(500);
pub(crate) const DEFAULT_RETRY_BUDGET: u32 = 4;
pub(crate) const MAX_DB_INDEX: u8 = 15;

/// A Redis server address plus the per-connection policy of the client
/// using it.
///
/// Immutable while a connection attempt is running; `reconnect` on either
/// client may swap in a replacement for the next attempt.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) password: Option<String>,
    pub(crate) db: u8,
    pub(crate) reconnect_interval: Duration,
    pub(crate) retry_budget: u32,
    pub(crate) inactivity: Option<(Duration, Duration)>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Endpoint {
        Endpoint {
            host: host.into(),
            port,
            password: None,
            db: 0,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            retry_budget: DEFAULT_RETRY_BUDGET,
            inactivity: None,
        }
    }

    /// Parses a `redis://[:password@]host[:port][/db]` URI.
    ///
    /// The port defaults to 6379 and the database index to 0; an absent or
    /// empty path also means database 0.
    pub fn from_uri(uri: &str) -> Result<Endpoint, Error> {
        let url = Url::parse(uri)
            .map_err(|e| Error::InvalidArgument(format!("cannot parse URI: {}", e)))?;
        if url.scheme() != "redis" {
            return Err(Error::InvalidArgument(format!(
                "unsupported URI scheme: {}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidArgument("URI has no host".to_owned()))?;

        let mut endpoint = Endpoint::new(host, url.port().unwrap_or(DEFAULT_PORT));
        if let Some(password) = url.password() {
            endpoint.password = Some(password.to_owned());
        }
        let path = url.path().trim_start_matches('/');
        if !path.is_empty() {
            let db = path
                .parse()
                .map_err(|_| Error::InvalidArgument(format!("invalid database index: {}", path)))?;
            endpoint = endpoint.db(db)?;
        }
        Ok(endpoint)
    }

    pub fn password(mut self, password: impl Into<String>) -> Endpoint {
        self.password = Some(password.into());
        self
    }

    /// Selects a database index in 0..=15.
    pub fn db(mut self, db: u8) -> Result<Endpoint, Error> {
        if db > MAX_DB_INDEX {
            return Err(Error::InvalidArgument(format!(
                "database index out of range: {}",
                db
            )));
        }
        self.db = db;
        Ok(self)
    }

    /// How long to wait before retrying after a failed connection attempt.
    /// A lost established connection is always retried immediately.
    pub fn reconnect_interval(mut self, interval: Duration) -> Endpoint {
        self.reconnect_interval = interval;
        self
    }

    /// How many consecutive failed attempts are tolerated before the client
    /// gives up and enters the failed state.
    pub fn retry_budget(mut self, attempts: u32) -> Endpoint {
        self.retry_budget = attempts;
        self
    }

    /// Enables the inactivity probe: after `trigger` of inbound silence a
    /// ping is sent, and after `response_timeout` more without any inbound
    /// traffic the connection is torn down and re-established.
    pub fn inactivity_check(mut self, trigger: Duration, response_timeout: Duration) -> Endpoint {
        self.inactivity = Some((trigger, response_timeout));
        self
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Endpoint;

    #[test]
    fn bare_uri_uses_defaults() {
        let endpoint = Endpoint::from_uri("redis://example.com").unwrap();
        assert_eq!(endpoint.host, "example.com");
        assert_eq!(endpoint.port, 6379);
        assert_eq!(endpoint.password, None);
        assert_eq!(endpoint.db, 0);
    }

    #[test]
    fn full_uri_parses_every_part() {
        let endpoint = Endpoint::from_uri("redis://:sekrit@cache.local:6380/9").unwrap();
        assert_eq!(endpoint.host, "cache.local");
        assert_eq!(endpoint.port, 6380);
        assert_eq!(endpoint.password.as_deref(), Some("sekrit"));
        assert_eq!(endpoint.db, 9);
    }

    #[test]
    fn empty_path_means_database_zero() {
        let endpoint = Endpoint::from_uri("redis://example.com/").unwrap();
        assert_eq!(endpoint.db, 0);
    }

    #[test]
    fn out_of_range_database_is_rejected() {
        assert!(Endpoint::from_uri("redis://example.com/16").is_err());
        assert!(Endpoint::from_uri("redis://example.com/x").is_err());
        assert!(Endpoint::new("example.com", 6379).db(16).is_err());
    }

    #[test]
    fn non_redis_schemes_are_rejected() {
        assert!(Endpoint::from_uri("http://example.com").is_err());
    }

    #[test]
    fn builder_setters_stick() {
        let endpoint = Endpoint::new("localhost", 7000)
            .password("pw")
            .db(3)
            .unwrap()
            .reconnect_interval(Duration::from_millis(20))
            .retry_budget(2)
            .inactivity_check(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(endpoint.password.as_deref(), Some("pw"));
        assert_eq!(endpoint.db, 3);
        assert_eq!(endpoint.reconnect_interval, Duration::from_millis(20));
        assert_eq!(endpoint.retry_budget, 2);
        assert_eq!(
            endpoint.inactivity,
            Some((Duration::from_secs(2), Duration::from_secs(1)))
        );
    }
}
