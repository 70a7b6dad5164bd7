use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{new_entity_id, Entity, EntityKind, RecordKey};

/// A shared cost inside a trip, split evenly between participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    pub id: String,
    pub trip_id: String,
    pub description: String,
    pub amount: Decimal,
    pub currency: String,
    /// Email of the person who paid.
    pub paid_by: String,
    #[serde(default)]
    pub split_between: Vec<String>,
    pub spent_on: Option<NaiveDate>,
    pub category: Option<String>,
}

impl Expense {
    pub fn new(
        trip_id: impl Into<String>,
        description: impl Into<String>,
        amount: Decimal,
        currency: impl Into<String>,
        paid_by: impl Into<String>,
    ) -> Self {
        Self {
            id: new_entity_id(),
            trip_id: trip_id.into(),
            description: description.into(),
            amount,
            currency: currency.into(),
            paid_by: paid_by.into(),
            split_between: Vec::new(),
            spent_on: None,
            category: None,
        }
    }
}

impl Entity for Expense {
    const KIND: EntityKind = EntityKind::Expense;

    fn id(&self) -> &str {
        &self.id
    }

    fn record_key(&self) -> RecordKey {
        RecordKey::new(EntityKind::Expense, &self.id).in_trip(&self.trip_id)
    }
}

/// Net position of one person in one currency. Positive means the person is
/// owed money.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseBalance {
    pub person: String,
    pub currency: String,
    pub net: Decimal,
}

/// Computes per-person, per-currency balances. An expense without
/// participants is treated as a personal cost of the payer.
pub fn expense_balances<'a>(expenses: impl IntoIterator<Item = &'a Expense>) -> Vec<ExpenseBalance> {
    let mut totals: BTreeMap<(String, String), Decimal> = BTreeMap::new();

    for expense in expenses {
        let participants: Vec<&String> = if expense.split_between.is_empty() {
            vec![&expense.paid_by]
        } else {
            expense.split_between.iter().collect()
        };
        let share = expense.amount / Decimal::from(participants.len() as u64);

        *totals
            .entry((expense.paid_by.clone(), expense.currency.clone()))
            .or_default() += expense.amount;
        for person in participants {
            *totals
                .entry((person.clone(), expense.currency.clone()))
                .or_default() -= share;
        }
    }

    totals
        .into_iter()
        .map(|((person, currency), net)| ExpenseBalance {
            person,
            currency,
            net: net.round_dp(2).normalize(),
        })
        .collect()
}
