//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//!
//! # Metrics
//!
//! - `lot_transitions_total{event_type}` - Committed lot events by type
//! - `lot_stock_extractions_total` - Successful extractions
//! - `lot_stock_extractions_refused_total` - Extractions refused for insufficient stock
//! - `lot_stock_extracted_volume_litres` - Volume drawn from stock
//! - `lot_stock_positions_created_total` - Stock positions opened
//! - `lot_reconciliation_findings` - Findings of the last reconciliation run
//! - `lot_reconciliation_corrections_total` - Corrections applied by the checker
//! - `lot_reconciliation_duration_seconds` - Histogram of run durations

use prometheus::{
    Counter, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::types::EventType;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Committed events by type
    pub transitions: IntCounterVec,

    /// Successful extractions
    pub extractions: IntCounter,

    /// Refused extractions
    pub extractions_refused: IntCounter,

    /// Volume extracted from stock
    pub extracted_volume: Counter,

    /// Stock positions opened
    pub positions_created: IntCounter,

    /// Findings of the last reconciliation run
    pub reconciliation_findings: IntGauge,

    /// Corrections applied
    pub reconciliation_corrections: IntCounter,

    /// Reconciliation run duration
    pub reconciliation_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let transitions = IntCounterVec::new(
            Opts::new("lot_transitions_total", "Committed lot events by type"),
            &["event_type"],
        )?;
        registry.register(Box::new(transitions.clone()))?;

        let extractions =
            IntCounter::new("lot_stock_extractions_total", "Successful stock extractions")?;
        registry.register(Box::new(extractions.clone()))?;

        let extractions_refused = IntCounter::new(
            "lot_stock_extractions_refused_total",
            "Extractions refused for insufficient stock",
        )?;
        registry.register(Box::new(extractions_refused.clone()))?;

        let extracted_volume = Counter::new(
            "lot_stock_extracted_volume_litres",
            "Volume drawn from stock positions",
        )?;
        registry.register(Box::new(extracted_volume.clone()))?;

        let positions_created = IntCounter::new(
            "lot_stock_positions_created_total",
            "Stock positions opened",
        )?;
        registry.register(Box::new(positions_created.clone()))?;

        let reconciliation_findings = IntGauge::new(
            "lot_reconciliation_findings",
            "Findings of the last reconciliation run",
        )?;
        registry.register(Box::new(reconciliation_findings.clone()))?;

        let reconciliation_corrections = IntCounter::new(
            "lot_reconciliation_corrections_total",
            "Corrections applied by the reconciliation checker",
        )?;
        registry.register(Box::new(reconciliation_corrections.clone()))?;

        let reconciliation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "lot_reconciliation_duration_seconds",
                "Histogram of reconciliation run durations",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        )?;
        registry.register(Box::new(reconciliation_duration.clone()))?;

        Ok(Self {
            transitions,
            extractions,
            extractions_refused,
            extracted_volume,
            positions_created,
            reconciliation_findings,
            reconciliation_corrections,
            reconciliation_duration,
            registry,
        })
    }

    /// Record a committed event
    pub fn record_transition(&self, event_type: EventType) {
        self.transitions
            .with_label_values(&[event_type.as_str()])
            .inc();
    }

    /// Record a successful extraction
    pub fn record_extraction(&self, amount: Decimal) {
        self.extractions.inc();
        self.extracted_volume.inc_by(amount.to_f64().unwrap_or(0.0));
    }

    /// Record an extraction refused for insufficient stock
    pub fn record_extraction_refused(&self) {
        self.extractions_refused.inc();
    }

    /// Record a stock position opened
    pub fn record_position_created(&self) {
        self.positions_created.inc();
    }

    /// Record the outcome of a reconciliation run
    pub fn record_reconciliation(&self, findings: usize, corrections: usize, seconds: f64) {
        self.reconciliation_findings.set(findings as i64);
        self.reconciliation_corrections.inc_by(corrections as u64);
        self.reconciliation_duration.observe(seconds);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
