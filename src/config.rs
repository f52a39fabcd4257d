use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::FixedOffset;
use clap::{Parser, ValueEnum};

use crate::crypto::{
    CvvProvider, HmacCvvProvider, HsmCvvProvider, PanHasher, SecretKey, SoftDes3Module,
};
use crate::expiry::ExpiryCalculator;
use crate::issuer::{DEFAULT_BIN, DEFAULT_PRODUCT, DEFAULT_SERVICE_CODE, IssuerSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CvvProviderKind {
    /// HMAC-SHA256 keyed with CVV_KEY
    Hmac,
    /// 3DES CMAC in a software module keyed with HSM_CVK
    SoftHsm,
}

/// Validity years per card product, written "credit=3,debit=5".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductYears(pub Vec<(String, u32)>);

impl FromStr for ProductYears {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (product, years) = entry
                    .split_once('=')
                    .ok_or_else(|| format!("expected product=years, got {:?}", entry))?;
                let product = product.trim();
                let years: u32 = years
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid years for {:?}", product))?;
                if years == 0 {
                    return Err(format!("years for {:?} must be positive", product));
                }
                Ok((product.to_lowercase(), years))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(ProductYears)
    }
}

fn parse_offset(s: &str) -> Result<FixedOffset, String> {
    s.parse::<FixedOffset>()
        .map_err(|e| format!("invalid UTC offset {:?}: {}", s, e))
}

#[derive(Parser, Clone)]
#[command(name = "card-issuer")]
#[command(about = "Debit card issuing and authorization service")]
#[command(version)]
pub struct Config {
    /// Host address to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "8080")]
    pub port: u16,

    /// SQLite database URL
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://issuer.db")]
    pub database_url: String,

    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value = "8")]
    pub db_max_connections: u32,

    /// Hex key peppering the stored PAN hashes
    #[arg(long, env = "PAN_HASH_KEY", hide_env_values = true)]
    pub pan_hash_key: String,

    /// Issuer BIN (6, 8 or 9 digits)
    #[arg(long, env = "BIN_PREFIX", default_value = DEFAULT_BIN)]
    pub bin_prefix: String,

    #[arg(long, env = "CARD_PRODUCT", default_value = DEFAULT_PRODUCT)]
    pub card_product: String,

    /// Validity years per product, e.g. "credit=3,debit=5"
    #[arg(long, env = "PRODUCT_YEARS", default_value = "credit=3,debit=5")]
    pub product_years: ProductYears,

    /// Offset used to compute and check expiry months
    #[arg(long, env = "EXPIRY_UTC_OFFSET", default_value = "+00:00", value_parser = parse_offset)]
    pub expiry_utc_offset: FixedOffset,

    #[arg(long, env = "REISSUE_WINDOW_DAYS", default_value = "30")]
    pub reissue_window_days: u32,

    /// Lifetime of a hold when the authorization does not set one
    #[arg(long, env = "HOLD_TTL_SECS", default_value = "604800")]
    pub hold_ttl_secs: u64,

    /// Seconds between expired-hold sweeps; 0 disables the sweeper
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value = "60")]
    pub sweep_interval_secs: u64,

    #[arg(long, env = "SWEEP_BATCH_SIZE", default_value = "500")]
    pub sweep_batch_size: u32,

    #[arg(long, env = "CVV_PROVIDER", value_enum, default_value = "hmac")]
    pub cvv_provider: CvvProviderKind,

    /// Hex key for the HMAC provider
    #[arg(long, env = "CVV_KEY", hide_env_values = true)]
    pub cvv_key: Option<String>,

    /// Use a built-in public CVV key. Never for production.
    #[arg(long, env = "CVV_DEMO")]
    pub cvv_demo: bool,

    /// Hex 24-byte 3DES CVK for the soft-hsm provider
    #[arg(long, env = "HSM_CVK", hide_env_values = true)]
    pub hsm_cvk: Option<String>,

    #[arg(long, env = "SERVICE_CODE", default_value = DEFAULT_SERVICE_CODE)]
    pub service_code: String,

    /// Dynamic CVV window length
    #[arg(long, env = "DCVV_STEP_SECS", default_value = "30")]
    pub dcvv_step_secs: u64,
}

impl Config {
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }

    pub fn expiry_calculator(&self) -> ExpiryCalculator {
        ExpiryCalculator::new(self.expiry_utc_offset, self.product_years.0.clone())
    }

    pub fn issuer_settings(&self) -> IssuerSettings {
        IssuerSettings {
            bin: self.bin_prefix.clone(),
            card_product: self.card_product.clone(),
            service_code: self.service_code.clone(),
            dcvv_step: Duration::from_secs(self.dcvv_step_secs.max(1)),
            hold_ttl: Duration::from_secs(self.hold_ttl_secs),
            reissue_window_days: self.reissue_window_days,
            sweep_batch_size: self.sweep_batch_size,
        }
    }

    pub fn pan_hasher(&self) -> Result<PanHasher> {
        let key = SecretKey::from_hex(&self.pan_hash_key).context("PAN_HASH_KEY")?;
        Ok(PanHasher::new(&key)?)
    }

    /// Missing keys are fatal; the only way to run keyless is `--cvv-demo`
    /// with the HMAC provider.
    pub fn cvv_provider(&self) -> Result<Arc<dyn CvvProvider>> {
        match self.cvv_provider {
            CvvProviderKind::Hmac => match (&self.cvv_key, self.cvv_demo) {
                (Some(hex_key), _) => {
                    let key = SecretKey::from_hex(hex_key).context("CVV_KEY")?;
                    Ok(Arc::new(HmacCvvProvider::new(key)))
                }
                (None, true) => Ok(Arc::new(HmacCvvProvider::demo())),
                (None, false) => bail!("CVV_KEY is required unless CVV_DEMO is set"),
            },
            CvvProviderKind::SoftHsm => {
                let Some(hex_key) = &self.hsm_cvk else {
                    bail!("HSM_CVK is required for the soft-hsm provider");
                };
                let cvk = SecretKey::from_hex(hex_key).context("HSM_CVK")?;
                let module = SoftDes3Module::new(cvk).context("HSM_CVK")?;
                Ok(Arc::new(HsmCvvProvider::new(module)))
            }
        }
    }
}
