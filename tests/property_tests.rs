//! Property-based tests using proptest
//!
//! These tests verify invariants across randomized inputs, helping catch
//! edge cases that might be missed by example-based testing.

use proptest::prelude::*;
use std::time::Duration;
use weights_manager::config::ManagerConfig;
use weights_manager::progress::{estimate_rate, parse_percent};
use weights_manager::validate::{
    MAX_ID_LEN, has_shell_metachars, valid_artifact_id, valid_filename, valid_url,
};

fn allowed() -> Vec<String> {
    vec!["huggingface.co".to_string()]
}

// =============================================================================
// Validator Properties
// =============================================================================

proptest! {
    /// Ids drawn from the permitted alphabet and length are always accepted
    #[test]
    fn valid_ids_accepted(id in "[A-Za-z0-9._-]{1,150}") {
        prop_assert!(valid_artifact_id(&id));
    }

    /// Any id containing a separator or shell metacharacter is rejected
    #[test]
    fn ids_with_forbidden_chars_rejected(
        prefix in "[a-z0-9]{0,20}",
        bad in prop::sample::select(vec!['/', '\\', ';', '&', '|', '`', ' ', '$', '\n']),
        suffix in "[a-z0-9]{0,20}",
    ) {
        let id = format!("{prefix}{bad}{suffix}");
        prop_assert!(!valid_artifact_id(&id));
    }

    #[test]
    fn overlong_ids_rejected(id in "[a-z]{151,200}") {
        prop_assert!(id.len() > MAX_ID_LEN);
        prop_assert!(!valid_artifact_id(&id));
    }

    /// Validators never panic, whatever the input
    #[test]
    fn validators_total(s in ".*") {
        let _ = valid_artifact_id(&s);
        let _ = valid_filename(&s);
        let _ = valid_url(&s, &allowed());
        let _ = has_shell_metachars(&s);
    }

    /// Filenames that could escape the destination directory are rejected
    #[test]
    fn escaping_filenames_rejected(
        dir in "[a-z]{1,10}",
        sep in prop::sample::select(vec!["/", "\\", "../", "..\\"]),
        stem in "[a-z]{1,10}",
    ) {
        let name = format!("{dir}{sep}{stem}.gguf");
        prop_assert!(!valid_filename(&name));
    }

    /// Plain http is never accepted, even for allowed hosts
    #[test]
    fn http_scheme_rejected(path in "[a-z0-9/]{0,40}") {
        let url = format!("http://huggingface.co/{path}");
        prop_assert!(!valid_url(&url, &allowed()));
    }

    /// Subdomains of an allowed host pass; look-alike suffixes do not
    #[test]
    fn host_suffix_matching(label in "[a-z][a-z0-9-]{0,15}") {
        let sub = format!("https://{label}.huggingface.co/m.gguf");
        prop_assert!(valid_url(&sub, &allowed()));

        let lookalike = format!("https://{label}huggingface.co/m.gguf");
        prop_assert!(!valid_url(&lookalike, &allowed()));
    }
}

// =============================================================================
// Progress Parser Properties
// =============================================================================

proptest! {
    /// Parsed values are always within 0..=100
    #[test]
    fn parsed_percent_in_range(line in ".*") {
        if let Some(p) = parse_percent(&line) {
            prop_assert!(p <= 100);
        }
    }

    /// A percent embedded in wget-style noise is recovered
    #[test]
    fn wget_percent_recovered(
        kb in 0u32..10_000_000,
        percent in 0u8..=100,
        speed in "[0-9]{1,3}\\.[0-9][KMG]",
    ) {
        let line = format!(" {kb}K ........ ........ ........  {percent}% {speed} 3m");
        prop_assert_eq!(parse_percent(&line), Some(percent));
    }

    /// Curl fractional percents truncate to the integer part
    #[test]
    fn curl_fraction_truncates(percent in 0u8..100, frac in 0u8..10) {
        let line = format!("####################   {percent}.{frac}%");
        prop_assert_eq!(parse_percent(&line), Some(percent));
    }

    /// Rate math never yields NaN, infinities or negative speeds
    #[test]
    fn rate_estimate_is_finite(
        percent in 0u8..=100,
        size_gb in 0.001f64..500.0,
        elapsed_ms in 0u64..10_000_000,
    ) {
        let rate = estimate_rate(percent, size_gb, Duration::from_millis(elapsed_ms));
        prop_assert!(rate.speed_mbps.is_finite());
        prop_assert!(rate.speed_mbps >= 0.0);
        if percent == 100 {
            prop_assert_eq!(rate.eta_seconds, 0);
        }
    }
}

// =============================================================================
// Config Properties
// =============================================================================

proptest! {
    /// Serialized configs parse back to the same values
    #[test]
    fn config_toml_roundtrip(
        api_port in 1024u16..60000,
        poll_interval_ms in 1u64..=1000,
        max_retries in 1u32..10,
        retry_backoff_secs in 0u64..30,
    ) {
        let config = ManagerConfig {
            api_port,
            poll_interval_ms,
            max_retries,
            retry_backoff_secs,
            ..Default::default()
        };
        prop_assert!(config.validate().is_ok());

        let toml_str = toml::to_string(&config).unwrap();
        let parsed: ManagerConfig = toml::from_str(&toml_str).unwrap();

        prop_assert_eq!(parsed.api_port, api_port);
        prop_assert_eq!(parsed.poll_interval_ms, poll_interval_ms);
        prop_assert_eq!(parsed.max_retries, max_retries);
        prop_assert_eq!(parsed.retry_backoff_secs, retry_backoff_secs);
        prop_assert_eq!(parsed.tools, config.tools);
    }
}
