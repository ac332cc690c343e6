use reqwest::header::{HeaderMap, LINK};
use url::Url;

use crate::error::FetchError;

/// Find the `rel="next"` target among the `Link` headers of a response, resolved against the url
/// that produced the response. Sources send either one header per link or a comma separated list.
pub fn next_link(headers: &HeaderMap, current: &Url) -> Result<Option<Url>, FetchError> {
    let Some(target) = headers
        .get_all(LINK)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(find_next)
    else {
        return Ok(None);
    };

    current
        .join(target)
        .map(Some)
        .map_err(|source| FetchError::InvalidUrl {
            url: target.to_owned(),
            source,
        })
}

fn find_next(value: &str) -> Option<&str> {
    // Each link starts with `<`, which cannot appear unescaped inside the url or its params
    value.split('<').skip(1).find_map(|link| {
        let (target, params) = link.split_once('>')?;
        params
            .split(';')
            .filter_map(|param| param.trim().split_once('='))
            .filter(|(name, _)| name.trim().eq_ignore_ascii_case("rel"))
            .any(|(_, rel)| {
                rel.trim()
                    .trim_end_matches(',')
                    .trim_matches('"')
                    .split_whitespace()
                    .any(|r| r.eq_ignore_ascii_case("next"))
            })
            .then_some(target.trim())
    })
}
