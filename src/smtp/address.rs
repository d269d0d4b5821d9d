use std::sync::OnceLock;

use regex::Regex;

pub const MAX_ADDRESS_LEN: usize = 320;
pub const MAX_LOCAL_LEN: usize = 64;
pub const MAX_DOMAIN_LEN: usize = 255;
pub const MAX_HEADER_VALUE_LEN: usize = 1000;

fn address_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?xi)
            ^ [a-z0-9.!\#$%&'*+/=?^_`{|}~-]+
            @
            [a-z0-9]([a-z0-9-]*[a-z0-9])?
            (\.[a-z0-9]([a-z0-9-]*[a-z0-9])?)*
            $",
        )
        .expect("address regex is a constant")
    })
}

/// RFC-5321 shape check: total/local/domain length bounds plus the
/// dot-atom local-part and labeled-domain grammar.
pub fn is_valid_address_shape(address: &str) -> bool {
    if address.is_empty() || address.len() > MAX_ADDRESS_LEN {
        return false;
    }

    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };

    if local.is_empty() || local.len() > MAX_LOCAL_LEN {
        return false;
    }
    if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
        return false;
    }

    address_regex().is_match(address)
}

/// Rejects CRLF injection in header values and truncates to the maximum
/// stored header-value length.
pub fn sanitize_header_value(value: &str) -> Option<String> {
    if value.contains('\r') || value.contains('\n') {
        return None;
    }

    Some(value.chars().take(MAX_HEADER_VALUE_LEN).collect())
}
