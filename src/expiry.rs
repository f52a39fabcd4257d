use std::collections::HashMap;

use chrono::{DateTime, Datelike, Days, Duration, FixedOffset, Offset, TimeZone, Utc};

pub const DEFAULT_YEARS: u32 = 5;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExpiryError {
    #[error("expiry must be YYMM (4 digits)")]
    Length,

    #[error("expiry must be digits: YYMM")]
    NotNumeric,

    #[error("expiry month must be 01..12")]
    Month,

    #[error("card face must be MM/YY or MMYY")]
    CardFace,

    #[error("expiry instant out of range")]
    OutOfRange,
}

/// Validate a YYMM expiry string.
pub fn validate_yymm(yymm: &str) -> Result<(), ExpiryError> {
    if yymm.len() != 4 {
        return Err(ExpiryError::Length);
    }
    if !yymm.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ExpiryError::NotNumeric);
    }
    let month: u32 = yymm[2..].parse().map_err(|_| ExpiryError::NotNumeric)?;
    if !(1..=12).contains(&month) {
        return Err(ExpiryError::Month);
    }
    Ok(())
}

/// Accept "MM/YY" or "MMYY" and return YYMM.
pub fn parse_card_face(input: &str) -> Result<String, ExpiryError> {
    let s: String = input.trim().chars().filter(|c| *c != '/').collect();
    if s.len() != 4 {
        return Err(ExpiryError::CardFace);
    }
    if !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ExpiryError::NotNumeric);
    }
    let month: u32 = s[..2].parse().map_err(|_| ExpiryError::NotNumeric)?;
    if !(1..=12).contains(&month) {
        return Err(ExpiryError::Month);
    }
    Ok(format!("{}{:02}", &s[2..], month))
}

/// Card validity settings: the location expiry dates are computed in and the
/// validity period per card product.
#[derive(Debug, Clone)]
pub struct ExpiryCalculator {
    location: FixedOffset,
    product_years: HashMap<String, u32>,
}

impl Default for ExpiryCalculator {
    fn default() -> Self {
        Self::new(
            Utc.fix(),
            [("credit".to_string(), 3), ("debit".to_string(), 5)],
        )
    }
}

impl ExpiryCalculator {
    pub fn new(
        location: FixedOffset,
        product_years: impl IntoIterator<Item = (String, u32)>,
    ) -> Self {
        let product_years = product_years
            .into_iter()
            .map(|(product, years)| (product.to_lowercase(), years))
            .collect();
        Self {
            location,
            product_years,
        }
    }

    /// `override_years` wins when positive, then the product table, then
    /// [`DEFAULT_YEARS`].
    pub fn years_for_product(&self, product: &str, override_years: u32) -> u32 {
        if override_years > 0 {
            return override_years;
        }
        self.product_years
            .get(&product.to_lowercase())
            .copied()
            .unwrap_or(DEFAULT_YEARS)
    }

    fn expiry_parts<Tz: TimeZone>(&self, issue: &DateTime<Tz>, years: u32) -> (u32, u32) {
        let local = issue.with_timezone(&self.location);
        let year = (local.year() + years as i32).rem_euclid(100) as u32;
        (year, local.month())
    }

    pub fn yymm<Tz: TimeZone>(&self, issue: &DateTime<Tz>, years: u32) -> String {
        let (yy, mm) = self.expiry_parts(issue, years);
        format!("{:02}{:02}", yy, mm)
    }

    pub fn mmyy<Tz: TimeZone>(&self, issue: &DateTime<Tz>, years: u32) -> String {
        let (yy, mm) = self.expiry_parts(issue, years);
        format!("{:02}{:02}", mm, yy)
    }

    /// Expiry as printed on the card, "MM/YY".
    pub fn card_face<Tz: TimeZone>(&self, issue: &DateTime<Tz>, years: u32) -> String {
        let (yy, mm) = self.expiry_parts(issue, years);
        format!("{:02}/{:02}", mm, yy)
    }

    /// Last instant of the YYMM month: one nanosecond before the first
    /// instant of the following month.
    pub fn end_of_month(&self, yymm: &str) -> Result<DateTime<FixedOffset>, ExpiryError> {
        validate_yymm(yymm)?;
        let yy: i32 = yymm[..2].parse().map_err(|_| ExpiryError::NotNumeric)?;
        let mm: u32 = yymm[2..].parse().map_err(|_| ExpiryError::NotNumeric)?;

        let (year, month) = if mm == 12 {
            (2000 + yy + 1, 1)
        } else {
            (2000 + yy, mm + 1)
        };
        let first_of_next = self
            .location
            .with_ymd_and_hms(year, month, 1, 0, 0, 0)
            .single()
            .ok_or(ExpiryError::OutOfRange)?;

        Ok(first_of_next - Duration::nanoseconds(1))
    }

    /// True iff `at` is strictly after the end of the expiry month.
    pub fn is_expired<Tz: TimeZone>(
        &self,
        yymm: &str,
        at: &DateTime<Tz>,
    ) -> Result<bool, ExpiryError> {
        let end = self.end_of_month(yymm)?;
        Ok(at.with_timezone(&self.location) > end)
    }

    /// True iff `at` falls in `[end - window_days, end]`.
    pub fn reissue_due<Tz: TimeZone>(
        &self,
        yymm: &str,
        at: &DateTime<Tz>,
        window_days: u32,
    ) -> Result<bool, ExpiryError> {
        let end = self.end_of_month(yymm)?;
        let start = end
            .checked_sub_days(Days::new(u64::from(window_days)))
            .ok_or(ExpiryError::OutOfRange)?;
        let at = at.with_timezone(&self.location);
        Ok(at >= start && at <= end)
    }
}
