//! Subscription Filter
//!
//! Set-membership gates over exchange codes and instrument codes.
//! An empty set passes everything; when both sets are non-empty an event must pass
//! both gates.

use crate::error::{PlatformError, PlatformResult};
use crate::market::code::split_std_code;
use std::collections::HashSet;

/// Immutable once built; adapters keep it behind a shared reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionFilter {
    exchanges: HashSet<String>,
    codes: HashSet<String>,
}

impl SubscriptionFilter {
    /// Pass-all filter.
    pub fn pass_all() -> Self {
        Self::default()
    }

    /// Build from configured entries. Blank entries are a configuration error.
    pub fn build<E, C>(exchanges: E, codes: C) -> PlatformResult<Self>
    where
        E: IntoIterator,
        E::Item: AsRef<str>,
        C: IntoIterator,
        C::Item: AsRef<str>,
    {
        let mut filter = Self::default();
        for e in exchanges {
            let e = e.as_ref().trim();
            if e.is_empty() {
                return Err(PlatformError::Config("blank exchange filter entry".into()));
            }
            filter.exchanges.insert(e.to_string());
        }
        for c in codes {
            let c = c.as_ref().trim();
            if c.is_empty() {
                return Err(PlatformError::Config("blank code filter entry".into()));
            }
            filter.codes.insert(c.to_string());
        }
        Ok(filter)
    }

    pub fn is_pass_all(&self) -> bool {
        self.exchanges.is_empty() && self.codes.is_empty()
    }

    pub fn exchanges(&self) -> &HashSet<String> {
        &self.exchanges
    }

    pub fn codes(&self) -> &HashSet<String> {
        &self.codes
    }

    /// Membership test for one event.
    ///
    /// Code entries may be written either as the full standard code
    /// (`SSE.600000`) or as the bare instrument code (`600000`).
    pub fn accepts(&self, exchange: &str, code: &str) -> bool {
        let exchg_ok = self.exchanges.is_empty() || self.exchanges.contains(exchange);
        if !exchg_ok {
            return false;
        }
        if self.codes.is_empty() {
            return true;
        }
        if self.codes.contains(code) {
            return true;
        }
        let (_, bare) = split_std_code(code);
        self.codes.contains(bare)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_passes_all() {
        let f = SubscriptionFilter::pass_all();
        assert!(f.is_pass_all());
        assert!(f.accepts("SSE", "SSE.600000"));
        assert!(f.accepts("", "anything"));
    }

    #[test]
    fn test_exchange_gate() {
        let f = SubscriptionFilter::build(["SSE"], Vec::<String>::new()).unwrap();
        assert!(f.accepts("SSE", "SSE.600000"));
        assert!(!f.accepts("SZSE", "SZSE.000001"));
    }

    #[test]
    fn test_both_gates_apply() {
        let f = SubscriptionFilter::build(["SSE"], ["600000"]).unwrap();
        assert!(f.accepts("SSE", "SSE.600000"));
        assert!(!f.accepts("SSE", "SSE.600036"));
        assert!(!f.accepts("SZSE", "SZSE.600000"));
    }

    #[test]
    fn test_full_code_entry() {
        let f = SubscriptionFilter::build(Vec::<String>::new(), ["SZSE.000001"]).unwrap();
        assert!(f.accepts("SZSE", "SZSE.000001"));
        assert!(!f.accepts("SSE", "SSE.000002"));
    }

    #[test]
    fn test_blank_entry_rejected() {
        let err = SubscriptionFilter::build(["SSE", " "], Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, PlatformError::Config(_)));
    }
}
