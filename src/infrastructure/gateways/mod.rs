//! Shipped gateway integrations and the transport they run over.

pub mod card;
pub mod redirect;
pub mod signature;
pub mod transport;

use crate::application::registry::ProcessorRegistry;
use crate::config::ProcessorSettings;
use crate::domain::processor::{PaymentMethodKind, ProcessorRef};
use crate::error::{PaymentError, Result};
use card::CardGateway;
use redirect::RedirectGateway;
use std::sync::Arc;
use transport::{GatewayTransport, SimulatedGateway};

/// Builds one processor from its settings over the given transport.
pub fn build_processor(
    settings: &ProcessorSettings,
    transport: Arc<dyn GatewayTransport>,
) -> Result<ProcessorRef> {
    Ok(match settings.kind {
        PaymentMethodKind::Card => Arc::new(CardGateway::new(
            &settings.key,
            &settings.secret,
            settings.currencies.clone(),
            transport,
        )),
        PaymentMethodKind::Redirect => {
            let base_url = settings.redirect_base_url.as_deref().ok_or_else(|| {
                PaymentError::Config(format!(
                    "redirect processor `{}` needs redirect_base_url",
                    settings.key
                ))
            })?;
            Arc::new(RedirectGateway::new(
                &settings.key,
                &settings.secret,
                settings.currencies.clone(),
                base_url,
                settings.signature_tolerance,
                transport,
            ))
        }
    })
}

/// Registers every configured processor, choosing each one's transport.
pub fn build_registry_with<F>(
    processors: &[ProcessorSettings],
    transport_for: F,
) -> Result<ProcessorRegistry>
where
    F: Fn(&ProcessorSettings) -> Arc<dyn GatewayTransport>,
{
    processors
        .iter()
        .try_fold(ProcessorRegistry::builder(), |builder, settings| {
            builder.register(build_processor(settings, transport_for(settings))?)
        })
        .map(|builder| builder.build())
}

/// Registers every configured processor over its own simulated transport.
pub fn build_registry(processors: &[ProcessorSettings]) -> Result<ProcessorRegistry> {
    build_registry_with(processors, |settings| {
        Arc::new(SimulatedGateway::new(settings.key.clone()))
    })
}
