/// Data Models Module
///
/// This module defines the record that flows from the SQL Server source into the
/// MySQL staging table. A record has no identity beyond its source row; it is
/// rebuilt from scratch on every run.
use rust_decimal::Decimal;
use serde::Serialize;

/// Destination staging table, fully replaced on every run
pub const STAGING_TABLE: &str = "intermediate_wholesaler_credit";

/// One wholesaler's credit position
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreditRecord {
    /// Wholesaler code (`h_jume`)
    pub wholesaler_code: String,
    /// Wholesaler name (`h_name`), passed through as-is
    pub wholesaler_name: Option<String>,
    /// Discount rate (`jumehuga`), passed through as-is
    pub discount_rate: Option<Decimal>,
    /// Credit limit minus outstanding balance, nulls counted as zero
    pub credit_amount: Decimal,
}

impl CreditRecord {
    pub fn new(
        wholesaler_code: impl Into<String>,
        wholesaler_name: Option<String>,
        discount_rate: Option<Decimal>,
        credit_amount: Decimal,
    ) -> Self {
        Self { wholesaler_code: wholesaler_code.into(), wholesaler_name, discount_rate, credit_amount }
    }
}
