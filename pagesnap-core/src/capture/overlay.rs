//! Stylesheet hiding cookie banners, consent walls and modal overlays.
//!
//! Matching elements are hidden and moved off-screen, never removed, so
//! scripts that measure or reference them keep working.

pub const OVERLAY_SUPPRESSION_CSS: &str = r#"
#onetrust-banner-sdk,
#onetrust-consent-sdk,
#CybotCookiebotDialog,
#CybotCookiebotDialogBodyUnderlay,
#didomi-host,
#usercentrics-root,
#qc-cmp2-container,
#sp_message_container,
#credential_picker_container,
#truste-consent-track,
.fc-consent-root,
.qc-cmp2-container,
.cc-window,
.cc-banner,
.cookie-banner,
.cookie-consent,
.cookie-notice,
.gdpr-banner,
.modal-backdrop,
.newsletter-popup,
[id*="cookie-banner" i],
[id*="cookie-consent" i],
[class*="cookie-banner" i],
[class*="cookie-consent" i],
[class*="consent-banner" i],
[class*="CookieBanner"],
[aria-label*="cookie" i][role="dialog"],
[aria-modal="true"][role="dialog"],
iframe[src*="consent" i] {
  display: none !important;
  visibility: hidden !important;
  opacity: 0 !important;
  pointer-events: none !important;
  position: fixed !important;
  top: -10000px !important;
  left: -10000px !important;
}

html,
body {
  overflow: auto !important;
  position: static !important;
}

body.modal-open,
body.no-scroll,
html.no-scroll {
  overflow: auto !important;
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hides_without_removing() {
        assert!(OVERLAY_SUPPRESSION_CSS.contains("visibility: hidden"));
        assert!(OVERLAY_SUPPRESSION_CSS.contains("top: -10000px"));
        assert!(!OVERLAY_SUPPRESSION_CSS.contains("content:"));
    }

    #[test]
    fn braces_balance() {
        let open = OVERLAY_SUPPRESSION_CSS.matches('{').count();
        let close = OVERLAY_SUPPRESSION_CSS.matches('}').count();
        assert_eq!(open, close);
    }
}
