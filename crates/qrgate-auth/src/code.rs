//! Scannable code rendering
//!
//! The code encodes `<scheme>://qr-login?token=<token>&server=<url>`, which the
//! companion app resolves back to the issuer's completion endpoints.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::ImageFormat;
use qrcode::QrCode;
use std::io::Cursor;

/// Build the URI carried by the QR code
pub fn login_uri(scheme: &str, token: &str, server_url: &str) -> String {
    format!(
        "{}://qr-login?token={}&server={}",
        scheme,
        urlencoding(token),
        urlencoding(server_url)
    )
}

/// Render a payload as a square PNG of `size` pixels
pub fn render_png(payload: &str, size: u32) -> Result<Vec<u8>, String> {
    let code = QrCode::new(payload.as_bytes()).map_err(|e| e.to_string())?;
    let image = code.render::<image::Luma<u8>>().build();

    let resized = image::imageops::resize(
        &image,
        size,
        size,
        image::imageops::FilterType::Nearest,
    );

    let mut buffer = Cursor::new(Vec::new());
    resized
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(|e| e.to_string())?;
    Ok(buffer.into_inner())
}

/// Render a payload as an inline `data:` URL, ready for an `<img src>`
pub fn render_data_url(payload: &str, size: u32) -> Result<String, String> {
    let png = render_png(payload, size)?;
    Ok(format!("data:image/png;base64,{}", BASE64.encode(png)))
}

fn urlencoding(s: &str) -> String {
    s.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{:02X}", b),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_uri_escapes_server() {
        let uri = login_uri("qrgate", "abc123", "https://example.org:8443/x");
        assert_eq!(
            uri,
            "qrgate://qr-login?token=abc123&server=https%3A%2F%2Fexample.org%3A8443%2Fx"
        );
    }

    #[test]
    fn test_render_png_header() {
        let png = render_png("qrgate://qr-login?token=abc123", 128).unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn test_render_data_url() {
        let url = render_data_url("hello", 64).unwrap();
        assert!(url.starts_with("data:image/png;base64,"));
    }
}
