//! Email canonicalization and sender-name templating.
//!
//! Everything here runs before untrusted, agent-assembled text reaches a
//! provider API: addresses are canonicalized, syntax-checked, and the
//! sender-name placeholder tokens the agent leaves in drafts are replaced
//! with the resolved display name.

use std::sync::OnceLock;

use regex::Regex;

use crate::types::UserProfile;

/// Placeholder tokens the agent (or a template) may leave in a draft,
/// matched case-insensitively. `SENDER_NAME_FALLBACK` is deliberately one
/// of these, which keeps `apply_sender_placeholder` idempotent even when
/// resolution falls all the way through.
const SENDER_PLACEHOLDERS: &[&str] = &["[your name]", "[sender name]", "[my name]"];

/// Literal used when no profile data yields a usable name.
pub const SENDER_NAME_FALLBACK: &str = "[Your Name]";

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Syntactic local@domain.tld shape only; never a deliverability check.
        Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static email regex")
    })
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let alternation = SENDER_PLACEHOLDERS
            .iter()
            .map(|t| regex::escape(t))
            .collect::<Vec<_>>()
            .join("|");
        Regex::new(&format!("(?i){alternation}")).expect("static placeholder regex")
    })
}

/// Canonicalize an email address: strip any `Display Name <addr>` wrapper,
/// trim, lowercase.
///
/// `normalize_email("Jane Doe <JANE@Example.COM>")` → `"jane@example.com"`.
pub fn normalize_email(raw: &str) -> String {
    let inner = match (raw.find('<'), raw.rfind('>')) {
        (Some(lt), Some(gt)) if lt < gt => &raw[lt + 1..gt],
        _ => raw,
    };
    inner.trim().to_lowercase()
}

/// Syntactic email check on an already-normalized address.
pub fn is_valid_email(email: &str) -> bool {
    email_regex().is_match(email)
}

/// Resolve the display name to sign outgoing mail with.
///
/// Chain: stored display name → first + last name → capitalized local part
/// of the account email → literal placeholder.
pub fn resolve_sender_name(profile: Option<&UserProfile>) -> String {
    let Some(profile) = profile else {
        return SENDER_NAME_FALLBACK.to_string();
    };

    if let Some(name) = non_empty(profile.display_name.as_deref()) {
        return name.to_string();
    }

    let first = non_empty(profile.first_name.as_deref());
    let last = non_empty(profile.last_name.as_deref());
    match (first, last) {
        (Some(f), Some(l)) => return format!("{f} {l}"),
        (Some(f), None) => return f.to_string(),
        (None, Some(l)) => return l.to_string(),
        (None, None) => {}
    }

    let local = name_from_email_local_part(&profile.email);
    if !local.is_empty() {
        return local;
    }

    SENDER_NAME_FALLBACK.to_string()
}

/// Replace every sender-name placeholder in `text` with `sender_name`.
///
/// Runs independently on subject, html, and text bodies; idempotent, since
/// callers assemble drafts in multiple passes.
pub fn apply_sender_placeholder(text: &str, sender_name: &str) -> String {
    placeholder_regex()
        .replace_all(text, regex::NoExpand(sender_name))
        .into_owned()
}

/// Derive a display name from an email's local part (best-effort).
///
/// `"sarah.chen@acme.com"` → `"Sarah Chen"`.
fn name_from_email_local_part(email: &str) -> String {
    let local = email.split('@').next().unwrap_or("");
    local
        .split(|c: char| c == '.' || c == '_' || c == '-' || c == '+')
        .filter(|s| !s.is_empty())
        .map(|s| {
            let mut chars = s.chars();
            match chars.next() {
                Some(c) => c.to_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}
