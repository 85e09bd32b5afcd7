//! Request planning: the validated URL × form-factor cross product.

use cwv_core::{FormFactor, PipelineError, RequestDescriptor};
use tracing::{debug, warn};
use url::Url;

/// Absolute `http`/`https` URLs only.
pub fn is_valid_target_url(candidate: &str) -> bool {
    match Url::parse(candidate) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.has_host(),
        Err(_) => false,
    }
}

/// URL-major cross product of valid urls and accepted form-factor tokens.
pub fn plan_requests(
    urls: &[String],
    form_factors: &[String],
) -> Result<Vec<RequestDescriptor>, PipelineError> {
    let accepted_form_factors: Vec<FormFactor> = form_factors
        .iter()
        .filter_map(|token| {
            let parsed = FormFactor::from_token(token);
            if parsed.is_none() {
                warn!(form_factor = %token, "skipping unsupported form factor");
            }
            parsed
        })
        .collect();

    let mut descriptors = Vec::with_capacity(urls.len() * accepted_form_factors.len());
    for url in urls {
        if !is_valid_target_url(url) {
            warn!(url = %url, "skipping invalid url");
            continue;
        }
        for form_factor in &accepted_form_factors {
            descriptors.push(RequestDescriptor::new(url.clone(), *form_factor));
        }
    }

    if descriptors.is_empty() {
        return Err(PipelineError::Configuration(
            "no valid url / form factor combinations to request".to_string(),
        ));
    }
    debug!(requests = descriptors.len(), "planned requests");
    Ok(descriptors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn cross_product_is_url_major() {
        let plan = plan_requests(
            &strings(&["https://a.test", "https://b.test"]),
            &strings(&["PHONE", "DESKTOP"]),
        )
        .unwrap();
        let pairs: Vec<(&str, FormFactor)> = plan
            .iter()
            .map(|d| (d.url.as_str(), d.form_factor))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("https://a.test", FormFactor::Phone),
                ("https://a.test", FormFactor::Desktop),
                ("https://b.test", FormFactor::Phone),
                ("https://b.test", FormFactor::Desktop),
            ]
        );
    }

    #[test]
    fn invalid_url_is_skipped() {
        let plan = plan_requests(
            &strings(&["https://example.com", "invalid-url"]),
            &strings(&["PHONE"]),
        )
        .unwrap();
        assert_eq!(plan, vec![RequestDescriptor::new("https://example.com", FormFactor::Phone)]);
    }

    #[test]
    fn unknown_form_factor_is_skipped() {
        let plan = plan_requests(&strings(&["http://a.test"]), &strings(&["TABLET", "DESKTOP"])).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].form_factor, FormFactor::Desktop);
    }

    #[test]
    fn non_http_schemes_and_relative_urls_are_rejected() {
        for candidate in ["ftp://a.test", "/relative/path", "mailto:a@b.test", "file:///etc/hosts", "https//missing-colon"] {
            assert!(!is_valid_target_url(candidate), "{candidate} should be rejected");
        }
        assert!(is_valid_target_url("HTTPS://Example.com/path?q=1"));
    }

    #[test]
    fn empty_plan_is_a_configuration_error() {
        let err = plan_requests(&strings(&["nope"]), &strings(&["PHONE"])).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));

        let err = plan_requests(&strings(&["https://a.test"]), &strings(&["phone"])).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }
}
