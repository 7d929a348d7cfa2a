use crate::domain::money::Currency;
use crate::domain::payment::ProcessorKey;
use crate::domain::processor::{PaymentMethodKind, ProcessorRef};
use crate::error::{PaymentError, Result};
use serde::Serialize;
use std::collections::BTreeMap;

/// A payment option offered to the buyer for an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentMethod {
    pub processor: ProcessorKey,
    pub method: PaymentMethodKind,
}

/// Maps stable processor keys to their implementations.
///
/// Built once at start; the set of processors never changes afterwards.
pub struct ProcessorRegistry {
    processors: BTreeMap<ProcessorKey, ProcessorRef>,
}

impl ProcessorRegistry {
    pub fn builder() -> ProcessorRegistryBuilder {
        ProcessorRegistryBuilder::default()
    }

    /// Looks up a processor, failing with `InvalidProcessor` for unknown keys.
    pub fn resolve(&self, key: &str) -> Result<ProcessorRef> {
        self.processors
            .get(&ProcessorKey::from(key))
            .cloned()
            .ok_or_else(|| PaymentError::InvalidProcessor(key.to_string()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &ProcessorKey> {
        self.processors.keys()
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Enabled processors able to collect in `currency`, in key order.
    pub fn methods_for(&self, currency: Currency) -> Vec<PaymentMethod> {
        self.processors
            .values()
            .filter(|p| p.supports(currency))
            .map(|p| PaymentMethod {
                processor: p.key().clone(),
                method: p.method(),
            })
            .collect()
    }
}

#[derive(Default)]
pub struct ProcessorRegistryBuilder {
    processors: BTreeMap<ProcessorKey, ProcessorRef>,
}

impl ProcessorRegistryBuilder {
    /// Adds a processor under its own key. Registering a key twice is an error.
    pub fn register(mut self, processor: ProcessorRef) -> Result<Self> {
        let key = processor.key().clone();
        if self.processors.contains_key(&key) {
            return Err(PaymentError::Config(format!(
                "processor `{key}` registered twice"
            )));
        }
        self.processors.insert(key, processor);
        Ok(self)
    }

    pub fn build(self) -> ProcessorRegistry {
        ProcessorRegistry {
            processors: self.processors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::gateways::card::CardGateway;
    use crate::infrastructure::gateways::redirect::RedirectGateway;
    use crate::infrastructure::gateways::transport::SimulatedGateway;
    use std::sync::Arc;

    fn card(key: &str) -> ProcessorRef {
        Arc::new(CardGateway::new(
            key,
            "secret",
            vec![Currency::Eur, Currency::Usd],
            Arc::new(SimulatedGateway::new(key)),
        ))
    }

    fn redirect(key: &str) -> ProcessorRef {
        Arc::new(RedirectGateway::new(
            key,
            "secret",
            vec![Currency::Eur],
            "https://pay.example.test",
            std::time::Duration::from_secs(300),
            Arc::new(SimulatedGateway::new(key)),
        ))
    }

    #[test]
    fn test_resolve_known_and_unknown_keys() {
        let registry = ProcessorRegistry::builder()
            .register(card("gateway_a"))
            .unwrap()
            .build();
        assert_eq!(registry.resolve("gateway_a").unwrap().key().as_str(), "gateway_a");
        assert!(matches!(
            registry.resolve("nope"),
            Err(PaymentError::InvalidProcessor(key)) if key == "nope"
        ));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let result = ProcessorRegistry::builder()
            .register(card("gateway_a"))
            .unwrap()
            .register(card("gateway_a"));
        assert!(matches!(result, Err(PaymentError::Config(_))));
    }

    #[test]
    fn test_methods_follow_currency_support() {
        let registry = ProcessorRegistry::builder()
            .register(card("gateway_a"))
            .unwrap()
            .register(redirect("gateway_b"))
            .unwrap()
            .build();

        let eur = registry.methods_for(Currency::Eur);
        assert_eq!(eur.len(), 2);
        assert_eq!(eur[1].method, PaymentMethodKind::Redirect);

        let usd = registry.methods_for(Currency::Usd);
        assert_eq!(usd.len(), 1);
        assert_eq!(usd[0].processor.as_str(), "gateway_a");

        assert!(registry.methods_for(Currency::Jpy).is_empty());
    }
}
