use std::sync::Arc;
use tokio::time::Instant;

use tollgate_core::config::PaymentsConfig;
use tollgate_core::types::{Address, Amount, ChainId, Identity, Invoice, Promise};
use tollgate_crypto::{sign_promise, KeyPair};

use crate::error::PaymentError;
use crate::message::PaymentMessage;
use crate::pricing::{Price, PriceBounds, UsageMeter};

const MEGABYTE: u64 = 1024 * 1024;

/// What the consumer agreed to pay for, and the limits it pays within.
#[derive(Debug, Clone)]
pub struct PayerConfig {
    pub chain_id: ChainId,
    /// Provider channel the promises pay into.
    pub channel_id: Address,
    pub provider: Identity,
    /// Largest increase the payer signs for in one invoice.
    pub max_step: Amount,
    /// Tariff agreed with the provider.
    pub price: Price,
    pub price_bounds: PriceBounds,
    /// Highest hermes fee, in basis points.
    pub max_hermes_fee: u16,
    /// Bytes billed on top of the consumer's own count without complaint.
    pub data_leeway_bytes: u64,
}

impl PayerConfig {
    pub fn from_payments(
        cfg: &PaymentsConfig,
        chain_id: ChainId,
        channel_id: Address,
        provider: Identity,
        price: Price,
    ) -> Self {
        Self {
            chain_id,
            channel_id,
            provider,
            max_step: cfg.max_unpaid_invoice_value as Amount,
            price,
            price_bounds: PriceBounds::from_config(cfg),
            max_hermes_fee: cfg.max_hermes_fee,
            data_leeway_bytes: cfg.consumer_data_leeway_megabytes.saturating_mul(MEGABYTE),
        }
    }
}

/// Consumer side of a session: turns invoices into signed promises.
pub struct InvoicePayer {
    keypair: KeyPair,
    config: PayerConfig,
    meter: Option<Arc<dyn UsageMeter>>,
    started_at: Instant,
    hermes_fee: Option<u16>,
    agreement_id: Option<u64>,
    last: Option<Promise>,
}

impl InvoicePayer {
    pub fn new(keypair: KeyPair, config: PayerConfig) -> Self {
        Self {
            keypair,
            config,
            meter: None,
            started_at: Instant::now(),
            hermes_fee: None,
            agreement_id: None,
            last: None,
        }
    }

    /// Count the session's traffic on the consumer side. Without a meter only
    /// the data leeway is paid for.
    pub fn with_meter(mut self, meter: Arc<dyn UsageMeter>) -> Self {
        self.meter = Some(meter);
        self
    }

    /// Record the fee the hermes currently charges. Invoices are refused
    /// while it is above `max_hermes_fee`.
    pub fn observe_hermes_fee(&mut self, fee_bps: u16) {
        if fee_bps > self.config.max_hermes_fee {
            tracing::warn!(fee_bps, limit = self.config.max_hermes_fee, "hermes fee above limit");
        }
        self.hermes_fee = Some(fee_bps);
    }

    pub fn last_promise(&self) -> Option<&Promise> {
        self.last.as_ref()
    }

    /// Most the provider can have earned so far at the agreed price.
    pub fn allowed_total(&self) -> Amount {
        let counted = self.meter.as_ref().map_or(0, |m| m.bytes_transferred());
        self.config
            .price
            .total(self.started_at.elapsed(), counted.saturating_add(self.config.data_leeway_bytes))
    }

    /// Sign a promise covering `invoice.agreement_total`.
    ///
    /// Invoices that do not raise the total are answered with the last
    /// promise, so resent invoices are never paid twice.
    pub fn pay(&mut self, invoice: &Invoice) -> Result<Promise, PaymentError> {
        if !invoice.is_hash_valid() {
            return Err(PaymentError::InvalidInvoice("hash does not match contents".into()));
        }
        if invoice.provider != self.config.provider {
            return Err(PaymentError::InvalidInvoice(format!(
                "issued by {} instead of {}",
                invoice.provider, self.config.provider
            )));
        }
        if invoice.chain_id != self.config.chain_id {
            return Err(PaymentError::InvalidInvoice(format!(
                "chain {} instead of {}",
                invoice.chain_id, self.config.chain_id
            )));
        }
        match self.agreement_id {
            Some(id) if id != invoice.agreement_id => {
                return Err(PaymentError::InvalidInvoice(format!(
                    "agreement {} does not match {}",
                    invoice.agreement_id, id
                )));
            }
            _ => {}
        }
        let price = self.config.price;
        if !self.config.price_bounds.contains(&price) {
            return Err(PaymentError::InvalidInvoice(format!(
                "price of {}/min and {}/GiB is outside the accepted bounds",
                price.per_minute, price.per_gib
            )));
        }
        if let Some(fee) = self.hermes_fee.filter(|fee| *fee > self.config.max_hermes_fee) {
            return Err(PaymentError::InvalidInvoice(format!(
                "hermes fee of {} bps exceeds the limit of {}",
                fee, self.config.max_hermes_fee
            )));
        }

        let previous = self.last.as_ref().map_or(0, |p| p.amount);
        if let Some(last) = &self.last {
            if invoice.agreement_total <= previous {
                tracing::debug!(total = %invoice.agreement_total, "invoice already paid");
                return Ok(last.clone());
            }
        }
        let step = invoice.agreement_total.saturating_sub(previous);
        if step > self.config.max_step {
            return Err(PaymentError::InvalidInvoice(format!(
                "increase of {} exceeds the limit of {}",
                step, self.config.max_step
            )));
        }
        let allowed = self.allowed_total();
        if invoice.agreement_total > allowed {
            return Err(PaymentError::InvalidInvoice(format!(
                "total of {} exceeds the {} earned at the agreed price",
                invoice.agreement_total, allowed
            )));
        }

        let mut promise = Promise::new(
            self.config.chain_id,
            self.config.channel_id,
            invoice.agreement_total,
            invoice.transactor_fee,
            invoice.hash,
        );
        sign_promise(&mut promise, &self.keypair);
        self.agreement_id = Some(invoice.agreement_id);
        self.last = Some(promise.clone());
        tracing::debug!(amount = %promise.amount, "promise signed");
        Ok(promise)
    }

    /// Answer an encoded invoice with an encoded promise.
    pub fn answer(&mut self, bytes: &[u8]) -> Result<Vec<u8>, PaymentError> {
        match PaymentMessage::decode(bytes)? {
            PaymentMessage::Invoice(invoice) => PaymentMessage::Promise(self.pay(&invoice)?).encode(),
            PaymentMessage::Promise(_) => Err(PaymentError::InvalidInvoice(
                "expected an invoice, got a promise".into(),
            )),
        }
    }
}
