use std::sync::Arc;

use crate::issuer::IssuerService;

#[derive(Clone)]
pub struct AppState {
    pub issuer: Arc<IssuerService>,
}
