//! Text and URL normalisation shared by the scorer and bucket keys.

use std::collections::BTreeSet;

use url::Url;

/// Lowercase, punctuation folded to spaces, whitespace collapsed.
pub fn normalize_text(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .flat_map(char::to_lowercase)
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn tokens(raw: &str) -> BTreeSet<String> {
    normalize_text(raw)
        .split(' ')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Comparable URL form: lowercase host without `www.`, no scheme, no
/// fragment, no `utm_*` parameters, no trailing slash. `None` for anything
/// unparsable.
pub fn normalize_url(raw: &str) -> Option<String> {
    let (_, key) = split_url(raw)?;
    Some(key)
}

/// Stored URL form: the same normalisation as `normalize_url`, keeping the
/// scheme. Only `http` and `https` are accepted.
pub fn canonical_url(raw: &str) -> Option<String> {
    let (scheme, key) = split_url(raw)?;
    matches!(scheme.as_str(), "http" | "https").then(|| format!("{scheme}://{key}"))
}

fn split_url(raw: &str) -> Option<(String, String)> {
    let url = Url::parse(raw.trim()).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);

    let mut query: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !k.starts_with("utm_"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    query.sort();

    let path = url.path().trim_end_matches('/');
    let mut out = format!("{host}{path}");
    if !query.is_empty() {
        let joined = query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        out.push('?');
        out.push_str(&joined);
    }
    Some((url.scheme().to_string(), out))
}

/// Dedupe bucket: the registrable-looking host of the URL.
pub fn bucket_key(raw_url: &str) -> String {
    Url::parse(raw_url.trim())
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        .map(|h| h.strip_prefix("www.").map(str::to_string).unwrap_or(h))
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn email_domain(email: &str) -> Option<String> {
    let (_, domain) = email.trim().rsplit_once('@')?;
    let domain = domain.trim().to_ascii_lowercase();
    (!domain.is_empty()).then_some(domain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("https://www.Example.org/jobs/42/", "example.org/jobs/42")]
    #[case("https://example.org/jobs/42#apply", "example.org/jobs/42")]
    #[case("https://example.org/jobs?id=4&utm_source=x", "example.org/jobs?id=4")]
    #[case("https://example.org/jobs?b=2&a=1", "example.org/jobs?a=1&b=2")]
    fn urls_normalise(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(normalize_url(raw).as_deref(), Some(expected));
    }

    #[test]
    fn garbage_url_has_no_normal_form() {
        assert_eq!(normalize_url("not a url"), None);
        assert_eq!(bucket_key("not a url"), "unknown");
    }

    #[test]
    fn canonical_url_keeps_the_scheme() {
        assert_eq!(
            canonical_url("https://www.X.org/jobs/1/?utm_medium=rss").as_deref(),
            Some("https://x.org/jobs/1")
        );
        assert_eq!(canonical_url("ftp://x.org/file"), None);
        assert_eq!(canonical_url("mailto:jo@x.org"), None);
    }

    #[test]
    fn bucket_key_is_the_host() {
        assert_eq!(bucket_key("https://www.foodshelf.org/volunteer"), "foodshelf.org");
    }

    #[test]
    fn text_normalisation_folds_case_and_punctuation() {
        assert_eq!(normalize_text("  Volunteer  Driver - Weekends!"), "volunteer driver weekends");
        assert_eq!(tokens("a-b a").len(), 2);
        assert_eq!(normalize_text("ÉTÉ Bénévole"), normalize_text("été bénévole"));
    }

    #[test]
    fn email_domain_is_lowercased() {
        assert_eq!(email_domain("Jo@FoodShelf.org").as_deref(), Some("foodshelf.org"));
        assert_eq!(email_domain("nobody"), None);
    }
}
