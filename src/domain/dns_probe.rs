use std::time::Duration;

#[cfg(not(test))]
use hickory_resolver::{
    Resolver,
    config::{LookupIpStrategy::Ipv4Only, ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
};
use thiserror::Error;
use tracing::{debug, trace};

pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(5);
pub const DEFAULT_VERIFICATION_PREFIX: &str = "_tempmail-verification";

#[derive(Debug, Error)]
pub enum DnsProbeError {
    #[error("DNS probe exceeded its deadline")]
    Timeout,
    #[error("MX lookup failed: {0}")]
    Mx(String),
    #[error("TXT lookup failed: {0}")]
    Txt(String),
}

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub mx_valid: bool,
    pub txt_valid: bool,
    pub observed_mx: Vec<String>,
    pub observed_txt: Vec<String>,
}

impl ProbeResult {
    pub fn ready(&self) -> bool {
        self.mx_valid && self.txt_valid
    }
}

#[cfg(not(test))]
#[derive(Clone)]
pub struct DnsProbe {
    resolver: Resolver<TokioConnectionProvider>,
    deadline: Duration,
}

#[cfg(test)]
#[derive(Clone)]
pub struct DnsProbe {
    resolver: mock::Resolver,
    deadline: Duration,
}

#[cfg(not(test))]
impl Default for DnsProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsProbe {
    #[cfg(not(test))]
    pub fn new() -> Self {
        let mut options = ResolverOpts::default();
        options.ip_strategy = Ipv4Only;
        options.attempts = 3;

        Self {
            resolver: Resolver::builder_with_config(
                ResolverConfig::default(),
                TokioConnectionProvider::default(),
            )
            .with_options(options)
            .build(),
            deadline: DEFAULT_DEADLINE,
        }
    }

    #[cfg(test)]
    pub fn mock(mx_hosts: &'static [&'static str], txt_records: &'static [&'static str]) -> Self {
        Self {
            resolver: mock::Resolver {
                mx: mx_hosts,
                txt: txt_records,
            },
            deadline: DEFAULT_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Runs MX and TXT lookups under one combined deadline and checks them
    /// against the expected mail server and verification token.
    pub async fn probe(
        &self,
        domain: &str,
        expected_mail_server: &str,
        expected_token: &str,
        verification_prefix: &str,
    ) -> Result<ProbeResult, DnsProbeError> {
        tokio::time::timeout(
            self.deadline,
            self.probe_inner(domain, expected_mail_server, expected_token, verification_prefix),
        )
        .await
        .map_err(|_| DnsProbeError::Timeout)?
    }

    async fn probe_inner(
        &self,
        domain: &str,
        expected_mail_server: &str,
        expected_token: &str,
        verification_prefix: &str,
    ) -> Result<ProbeResult, DnsProbeError> {
        let fqdn = format!("{domain}{}", if domain.ends_with('.') { "" } else { "." });

        let mx_hosts = self
            .resolver
            .resolve_mx(&fqdn)
            .await
            .map_err(|e| DnsProbeError::Mx(e.to_string()))?;
        trace!(?mx_hosts, "resolved MX records");

        let mx_valid = mx_hosts
            .iter()
            .any(|host| is_same_or_subdomain(host, expected_mail_server));

        let txt_name = format!("{verification_prefix}.{}.", domain.trim_end_matches('.'));
        let txt_records = self
            .resolver
            .resolve_txt(&txt_name)
            .await
            .map_err(|e| DnsProbeError::Txt(e.to_string()))?;
        trace!(?txt_records, "resolved TXT records");

        let txt_valid = txt_records.iter().any(|record| record == expected_token);

        debug!(domain, mx_valid, txt_valid, "DNS probe complete");

        Ok(ProbeResult {
            mx_valid,
            txt_valid,
            observed_mx: mx_hosts,
            observed_txt: txt_records,
        })
    }
}

fn is_same_or_subdomain(host: &str, expected: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let expected = expected.trim_end_matches('.').to_ascii_lowercase();
    host == expected || host.ends_with(&format!(".{expected}"))
}

#[cfg(not(test))]
trait ResolverExt {
    async fn resolve_mx(&self, name: &str) -> Result<Vec<String>, hickory_resolver::ResolveError>;
    async fn resolve_txt(&self, name: &str) -> Result<Vec<String>, hickory_resolver::ResolveError>;
}

#[cfg(not(test))]
impl ResolverExt for Resolver<TokioConnectionProvider> {
    async fn resolve_mx(&self, name: &str) -> Result<Vec<String>, hickory_resolver::ResolveError> {
        let lookup = self.mx_lookup(name).await?;
        Ok(lookup.iter().map(|mx| mx.exchange().to_utf8()).collect())
    }

    async fn resolve_txt(&self, name: &str) -> Result<Vec<String>, hickory_resolver::ResolveError> {
        let lookup = self.txt_lookup(name).await?;
        Ok(lookup
            .iter()
            .map(|record| {
                record
                    .txt_data()
                    .iter()
                    .flat_map(|chunk| chunk.iter().copied())
                    .map(|b| b as char)
                    .collect()
            })
            .collect())
    }
}

#[cfg(test)]
mod mock {
    #[derive(Clone, Copy)]
    pub struct Resolver {
        pub mx: &'static [&'static str],
        pub txt: &'static [&'static str],
    }

    #[derive(Debug)]
    pub struct MockError;

    impl std::fmt::Display for MockError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "mock resolver error")
        }
    }

    impl Resolver {
        pub async fn resolve_mx(&self, _name: &str) -> Result<Vec<String>, MockError> {
            Ok(self.mx.iter().map(|s| s.to_string()).collect())
        }

        pub async fn resolve_txt(&self, _name: &str) -> Result<Vec<String>, MockError> {
            Ok(self.txt.iter().map(|s| s.to_string()).collect())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn ready_when_mx_and_txt_match() {
        let probe = DnsProbe::mock(&["mail.example.com"], &["tok-123"]);
        let result = probe
            .probe("example.com", "mail.example.com", "tok-123", DEFAULT_VERIFICATION_PREFIX)
            .await
            .unwrap();

        assert!(result.ready());
    }

    #[tokio::test]
    async fn subdomain_mx_is_accepted() {
        let probe = DnsProbe::mock(&["relay.mail.example.com"], &["tok-123"]);
        let result = probe
            .probe("example.com", "mail.example.com", "tok-123", DEFAULT_VERIFICATION_PREFIX)
            .await
            .unwrap();

        assert!(result.mx_valid);
    }

    #[tokio::test]
    async fn mismatched_token_is_not_ready() {
        let probe = DnsProbe::mock(&["mail.example.com"], &["wrong-token"]);
        let result = probe
            .probe("example.com", "mail.example.com", "tok-123", DEFAULT_VERIFICATION_PREFIX)
            .await
            .unwrap();

        assert!(result.mx_valid);
        assert!(!result.txt_valid);
        assert!(!result.ready());
    }
}
