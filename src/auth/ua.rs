//! Minimal user-agent classification for login attempts and session rows.
//!
//! Order matters: Chrome's UA contains "Safari", Edge's contains "Chrome".
//! This is intentionally a coarse classifier, not a UA database.

/// Parsed browser / OS / device family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedUserAgent {
    pub browser: Option<String>,
    pub os: Option<String>,
    pub device_type: Option<String>,
}

#[must_use]
pub fn parse(user_agent: Option<&str>) -> ParsedUserAgent {
    let Some(ua) = user_agent else {
        return ParsedUserAgent::default();
    };

    let browser = if ua.contains("Edg/") || ua.contains("Edge/") {
        Some("Edge")
    } else if ua.contains("OPR/") || ua.contains("Opera") {
        Some("Opera")
    } else if ua.contains("Chrome/") {
        Some("Chrome")
    } else if ua.contains("Firefox/") {
        Some("Firefox")
    } else if ua.contains("Safari/") {
        Some("Safari")
    } else if ua.contains("curl/") {
        Some("curl")
    } else {
        None
    };

    let os = if ua.contains("Windows") {
        Some("Windows")
    } else if ua.contains("iPhone") || ua.contains("iPad") {
        Some("iOS")
    } else if ua.contains("Mac OS X") || ua.contains("Macintosh") {
        Some("macOS")
    } else if ua.contains("Android") {
        Some("Android")
    } else if ua.contains("Linux") {
        Some("Linux")
    } else {
        None
    };

    let device_type = if ua.contains("iPad") || ua.contains("Tablet") {
        Some("tablet")
    } else if ua.contains("Mobile") || ua.contains("iPhone") || ua.contains("Android") {
        Some("mobile")
    } else if ua.contains("bot") || ua.contains("Bot") || ua.contains("curl/") {
        Some("bot")
    } else {
        Some("desktop")
    };

    ParsedUserAgent {
        browser: browser.map(str::to_string),
        os: os.map(str::to_string),
        device_type: device_type.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHROME_WIN: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                              (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    const SAFARI_IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) \
                                 AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 \
                                 Mobile/15E148 Safari/604.1";
    const FIREFOX_LINUX: &str =
        "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0";
    const EDGE_WIN: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                            (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0";

    #[test]
    fn chrome_on_windows() {
        let parsed = parse(Some(CHROME_WIN));
        assert_eq!(parsed.browser.as_deref(), Some("Chrome"));
        assert_eq!(parsed.os.as_deref(), Some("Windows"));
        assert_eq!(parsed.device_type.as_deref(), Some("desktop"));
    }

    #[test]
    fn safari_on_iphone_is_mobile() {
        let parsed = parse(Some(SAFARI_IPHONE));
        assert_eq!(parsed.browser.as_deref(), Some("Safari"));
        assert_eq!(parsed.os.as_deref(), Some("iOS"));
        assert_eq!(parsed.device_type.as_deref(), Some("mobile"));
    }

    #[test]
    fn firefox_on_linux() {
        let parsed = parse(Some(FIREFOX_LINUX));
        assert_eq!(parsed.browser.as_deref(), Some("Firefox"));
        assert_eq!(parsed.os.as_deref(), Some("Linux"));
    }

    #[test]
    fn edge_not_misread_as_chrome() {
        let parsed = parse(Some(EDGE_WIN));
        assert_eq!(parsed.browser.as_deref(), Some("Edge"));
    }

    #[test]
    fn missing_ua_yields_defaults() {
        assert_eq!(parse(None), ParsedUserAgent::default());
    }
}
