use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::{KeyError, SecretKey, Window};
use crate::cardgen::{self, PanError};
use crate::expiry::{self, ExpiryError};

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_DCVV_STEP: Duration = Duration::from_secs(30);

const STATIC_DOMAIN: &str = "static-v1";
const DYNAMIC_DOMAIN: &str = "dynamic-v1";

/// Hardcoded key for offline demos only. Never reachable without `--cvv-demo`.
const DEMO_KEY: &[u8] = b"card-issuer-demo-cvv-key-not-for-production";

#[derive(Debug, thiserror::Error)]
pub enum CvvError {
    #[error(transparent)]
    Expiry(#[from] ExpiryError),

    #[error(transparent)]
    Pan(#[from] PanError),

    #[error("service code must be 3 digits")]
    ServiceCode,

    #[error("panNoCD must be digits only")]
    PanNotNumeric,

    #[error("panNoCD length must be 12..18 (got {0})")]
    PanLength(usize),

    #[error("cvv key: {0}")]
    Key(#[from] KeyError),

    #[error("mac module failure: {0}")]
    Module(String),
}

/// A display code together with the seconds left in its window.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DynamicCvv {
    pub code: String,
    pub ttl_secs: u64,
}

/// Card verification code derivation.
///
/// Implementations must be interchangeable: callers pass the same inputs and
/// get codes of the same shape whichever provider is active.
pub trait CvvProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn compute_cvv2(
        &self,
        pan_no_cd: &str,
        yymm: &str,
        service_code: &str,
        width: u8,
    ) -> Result<String, CvvError>;

    /// Dynamic code for the window containing `now_unix`.
    fn compute_display_dcvv_at(
        &self,
        pan_no_cd: &str,
        yymm: &str,
        service_code: &str,
        step: Duration,
        width: u8,
        now_unix: i64,
    ) -> Result<DynamicCvv, CvvError>;

    fn compute_display_dcvv(
        &self,
        pan_no_cd: &str,
        yymm: &str,
        service_code: &str,
        step: Duration,
        width: u8,
    ) -> Result<DynamicCvv, CvvError> {
        self.compute_display_dcvv_at(
            pan_no_cd,
            yymm,
            service_code,
            step,
            width,
            Utc::now().timestamp(),
        )
    }
}

/// Only 4 is honoured; every other width means 3.
pub fn normalize_width(width: u8) -> usize {
    if width == 4 { 4 } else { 3 }
}

/// Whole seconds, at least one.
pub fn step_seconds(step: Duration) -> u64 {
    step.as_secs().max(1)
}

pub fn ttl_secs(now_unix: i64, step_secs: u64) -> u64 {
    let step = step_secs.max(1);
    let elapsed = u64::try_from(now_unix).unwrap_or(0) % step;
    match step - elapsed {
        0 => step,
        ttl => ttl,
    }
}

pub fn validate_inputs(pan_no_cd: &str, yymm: &str, service_code: &str) -> Result<(), CvvError> {
    expiry::validate_yymm(yymm)?;
    if service_code.len() != 3 || !cardgen::is_digits(service_code) {
        return Err(CvvError::ServiceCode);
    }
    if !cardgen::is_digits(pan_no_cd) {
        return Err(CvvError::PanNotNumeric);
    }
    if !(12..=18).contains(&pan_no_cd.len()) {
        return Err(CvvError::PanLength(pan_no_cd.len()));
    }
    Ok(())
}

/// Validate a full PAN and return it without its check digit.
pub fn strip_check_digit(pan: &str) -> Result<String, CvvError> {
    let pan = cardgen::normalize_pan(pan);
    cardgen::validate_pan(&pan)?;
    Ok(pan[..pan.len() - 1].to_string())
}

/// RFC 4226 dynamic truncation reduced to `width` decimal digits.
fn truncate(mac: &[u8], width: usize) -> String {
    let offset = (mac[mac.len() - 1] & 0x0f) as usize;
    let bin = u32::from_be_bytes([
        mac[offset] & 0x7f,
        mac[offset + 1],
        mac[offset + 2],
        mac[offset + 3],
    ]);
    let code = bin % 10u32.pow(width as u32);
    format!("{:0width$}", code, width = width)
}

/// HMAC-SHA256 reference provider.
#[derive(Debug)]
pub struct HmacCvvProvider {
    key: SecretKey,
}

impl HmacCvvProvider {
    pub fn new(key: SecretKey) -> Self {
        Self { key }
    }

    /// Provider keyed with a public constant. Codes are reproducible by anyone.
    pub fn demo() -> Self {
        tracing::warn!("CVV provider running in DEMO mode with a hardcoded key");
        Self {
            key: SecretKey(DEMO_KEY.to_vec()),
        }
    }

    fn mac(&self, message: &str, window: Option<Window>) -> Result<Vec<u8>, CvvError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.key.as_bytes())
            .map_err(|_| KeyError::Empty)?;
        mac.update(message.as_bytes());
        if let Some(window) = window {
            mac.update(&window.to_bytes());
        }
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

impl CvvProvider for HmacCvvProvider {
    fn name(&self) -> &'static str {
        "hmac"
    }

    fn compute_cvv2(
        &self,
        pan_no_cd: &str,
        yymm: &str,
        service_code: &str,
        width: u8,
    ) -> Result<String, CvvError> {
        let width = normalize_width(width);
        validate_inputs(pan_no_cd, yymm, service_code)?;

        let message = format!("{}|{}|{}|{}", pan_no_cd, yymm, service_code, STATIC_DOMAIN);
        let mac = self.mac(&message, None)?;
        Ok(truncate(&mac, width))
    }

    fn compute_display_dcvv_at(
        &self,
        pan_no_cd: &str,
        yymm: &str,
        service_code: &str,
        step: Duration,
        width: u8,
        now_unix: i64,
    ) -> Result<DynamicCvv, CvvError> {
        let width = normalize_width(width);
        let step = step_seconds(step);
        validate_inputs(pan_no_cd, yymm, service_code)?;

        let message = format!("{}|{}|{}|{}", pan_no_cd, yymm, service_code, DYNAMIC_DOMAIN);
        let mac = self.mac(&message, Some(Window::at(now_unix, step)))?;
        Ok(DynamicCvv {
            code: truncate(&mac, width),
            ttl_secs: ttl_secs(now_unix, step),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAN_NO_CD: &str = "421234567890123";

    fn provider() -> HmacCvvProvider {
        HmacCvvProvider::new(SecretKey::from_bytes(b"cvv-test-key-0123456789abcdef").unwrap())
    }

    #[test]
    fn test_static_cvv_vectors() {
        let p = provider();
        assert_eq!(p.compute_cvv2(PAN_NO_CD, "3012", "101", 3).unwrap(), "831");
        assert_eq!(p.compute_cvv2(PAN_NO_CD, "3012", "101", 4).unwrap(), "1831");
        assert_eq!(p.compute_cvv2(PAN_NO_CD, "3012", "201", 3).unwrap(), "827");
    }

    #[test]
    fn test_static_cvv_is_deterministic() {
        let p = provider();
        let first = p.compute_cvv2(PAN_NO_CD, "3012", "101", 3).unwrap();
        for _ in 0..10 {
            assert_eq!(p.compute_cvv2(PAN_NO_CD, "3012", "101", 3).unwrap(), first);
        }
    }

    #[test]
    fn test_width_normalization() {
        let p = provider();
        for width in [0, 1, 3, 5, 200] {
            assert_eq!(p.compute_cvv2(PAN_NO_CD, "3012", "101", width).unwrap().len(), 3);
        }
        assert_eq!(p.compute_cvv2(PAN_NO_CD, "3012", "101", 4).unwrap().len(), 4);
    }

    #[test]
    fn test_dynamic_cvv_vectors() {
        let p = provider();
        let step = Duration::from_secs(30);

        let at = |now| {
            p.compute_display_dcvv_at(PAN_NO_CD, "3012", "101", step, 3, now)
                .unwrap()
        };

        // 1_700_000_000 is 20s into its 30s window.
        assert_eq!(at(1_700_000_000), DynamicCvv { code: "081".into(), ttl_secs: 10 });
        assert_eq!(at(1_700_000_009), DynamicCvv { code: "081".into(), ttl_secs: 1 });
        assert_eq!(at(1_700_000_010), DynamicCvv { code: "350".into(), ttl_secs: 30 });

        let wide = p
            .compute_display_dcvv_at(PAN_NO_CD, "3012", "101", step, 4, 1_700_000_000)
            .unwrap();
        assert_eq!(wide.code, "0081");
    }

    #[test]
    fn test_dynamic_ttl_decreases_then_resets() {
        let p = provider();
        let step = Duration::from_secs(5);
        let start = 1_700_000_000 - (1_700_000_000 % 5);

        let mut last_ttl = u64::MAX;
        let first = p
            .compute_display_dcvv_at(PAN_NO_CD, "3012", "101", step, 3, start)
            .unwrap();
        for now in start..start + 5 {
            let d = p
                .compute_display_dcvv_at(PAN_NO_CD, "3012", "101", step, 3, now)
                .unwrap();
            assert_eq!(d.code, first.code);
            assert!(d.ttl_secs < last_ttl);
            last_ttl = d.ttl_secs;
        }
        assert_eq!(last_ttl, 1);

        let next = p
            .compute_display_dcvv_at(PAN_NO_CD, "3012", "101", step, 3, start + 5)
            .unwrap();
        assert_eq!(next.ttl_secs, 5);
    }

    #[test]
    fn test_dynamic_codes_differ_across_windows() {
        let p = provider();
        let step = Duration::from_secs(1);
        let codes: std::collections::HashSet<String> = (0..50)
            .map(|i| {
                p.compute_display_dcvv_at(PAN_NO_CD, "3012", "101", step, 4, 1_700_000_000 + i)
                    .unwrap()
                    .code
            })
            .collect();
        // 50 windows over 10_000 codes; a handful of collisions at most.
        assert!(codes.len() > 40, "only {} distinct codes", codes.len());
    }

    #[test]
    fn test_sub_second_step_is_one_second() {
        assert_eq!(step_seconds(Duration::from_millis(10)), 1);
        assert_eq!(step_seconds(Duration::from_millis(2500)), 2);
        assert_eq!(ttl_secs(1_700_000_000, 0), 1);
    }

    #[test]
    fn test_input_validation() {
        let p = provider();
        assert!(matches!(
            p.compute_cvv2(PAN_NO_CD, "3013", "101", 3),
            Err(CvvError::Expiry(ExpiryError::Month))
        ));
        assert!(matches!(
            p.compute_cvv2(PAN_NO_CD, "3012", "10", 3),
            Err(CvvError::ServiceCode)
        ));
        assert!(matches!(
            p.compute_cvv2(PAN_NO_CD, "3012", "1a1", 3),
            Err(CvvError::ServiceCode)
        ));
        assert!(matches!(
            p.compute_cvv2("4212x4567890123", "3012", "101", 3),
            Err(CvvError::PanNotNumeric)
        ));
        assert!(matches!(
            p.compute_cvv2("42123456789", "3012", "101", 3),
            Err(CvvError::PanLength(11))
        ));
        assert!(matches!(
            p.compute_cvv2("4212345678901234567", "3012", "101", 3),
            Err(CvvError::PanLength(19))
        ));
    }

    #[test]
    fn test_strip_check_digit() {
        let pan = cardgen::generate_pan("421234", "").unwrap();
        assert_eq!(strip_check_digit(&pan).unwrap(), &pan[..15]);
        assert_eq!(strip_check_digit("4212 3456 7890 1237").unwrap(), PAN_NO_CD);
        assert!(matches!(
            strip_check_digit("4212345678901232"),
            Err(CvvError::Pan(PanError::CheckDigit))
        ));
    }

    #[test]
    fn test_demo_provider_is_usable() {
        let p = HmacCvvProvider::demo();
        assert_eq!(p.name(), "hmac");
        assert_eq!(p.compute_cvv2(PAN_NO_CD, "3012", "101", 3).unwrap().len(), 3);
    }
}
