//! Hardware-module backed CVV derivation.
//!
//! The key never leaves the [`MacModule`]; the provider only assembles the
//! input and decimalizes the returned MAC. [`SoftDes3Module`] computes the
//! same 3DES CMAC in process for development and tests.

use std::time::Duration;

use cmac::{Cmac, Mac};
use des::TdesEde3;

use super::cvv::{
    CvvError, CvvProvider, DynamicCvv, normalize_width, step_seconds, ttl_secs, validate_inputs,
};
use super::{KeyError, SecretKey, Window};
use crate::cardgen::random_digits;

pub const DES3_KEY_LEN: usize = 24;

/// A MAC primitive executed inside a key-holding module.
pub trait MacModule: Send + Sync {
    fn mac(&self, data: &[u8]) -> Result<Vec<u8>, CvvError>;
}

/// In-process 3DES CMAC with a triple-length CVK.
#[derive(Debug)]
pub struct SoftDes3Module {
    cvk: SecretKey,
}

impl SoftDes3Module {
    pub fn new(cvk: SecretKey) -> Result<Self, KeyError> {
        if cvk.len() != DES3_KEY_LEN {
            return Err(KeyError::Length {
                expected: DES3_KEY_LEN,
                got: cvk.len(),
            });
        }
        Ok(Self { cvk })
    }
}

impl MacModule for SoftDes3Module {
    fn mac(&self, data: &[u8]) -> Result<Vec<u8>, CvvError> {
        let mut mac = <Cmac<TdesEde3> as Mac>::new_from_slice(self.cvk.as_bytes())
            .map_err(|e| CvvError::Module(format!("invalid CVK length: {:?}", e)))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

/// panNoCD || YYMM || service code, plus the hex window counter for dynamic codes.
fn assemble(pan_no_cd: &str, yymm: &str, service_code: &str, window: Option<Window>) -> Vec<u8> {
    let mut data = format!("{}{}{}", pan_no_cd, yymm, service_code);
    if let Some(window) = window {
        data.push_str(&hex::encode(window.to_bytes()));
    }
    data.into_bytes()
}

/// Map the MAC's hex digits to decimals (a-f become 0-5) and take `width` of
/// them. Random digits fill the tail only when the digest runs out.
pub fn decimalize(mac: &[u8], width: usize) -> String {
    let mut out: String = hex::encode(mac)
        .chars()
        .filter_map(|c| c.to_digit(16))
        .map(|n| char::from(b'0' + (n % 10) as u8))
        .take(width)
        .collect();
    if out.len() < width {
        out.push_str(&random_digits(width - out.len()));
    }
    out
}

pub struct HsmCvvProvider<M> {
    module: M,
}

impl<M: MacModule> HsmCvvProvider<M> {
    pub fn new(module: M) -> Self {
        Self { module }
    }
}

impl<M: MacModule> CvvProvider for HsmCvvProvider<M> {
    fn name(&self) -> &'static str {
        "hsm"
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

        let mac = self.module.mac(&assemble(pan_no_cd, yymm, service_code, None))?;
        Ok(decimalize(&mac, width))
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

        let window = Window::at(now_unix, step);
        let mac = self
            .module
            .mac(&assemble(pan_no_cd, yymm, service_code, Some(window)))?;
        Ok(DynamicCvv {
            code: decimalize(&mac, width),
            ttl_secs: ttl_secs(now_unix, step),
        })
    }
}
