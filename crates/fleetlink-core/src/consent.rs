//! Consent/onboarding URL helper.

/// Default host serving the end-user consent page.
pub const DEFAULT_CONSENT_HOST: &str = "my.shelly.cloud";

/// Build the URL an end user opens to grant the integrator access.
///
/// The callback URL is percent-encoded so it survives as a single query value.
pub fn consent_url(consent_host: &str, integrator_tag: &str, callback_url: &str) -> String {
    format!(
        "https://{consent_host}/integrator.html?itg={}&cb={}",
        urlencoding::encode(integrator_tag),
        urlencoding::encode(callback_url)
    )
}
