pub mod decision;

pub use decision::{
    BudgetReport, DecisionEngine, DecisionOutcome, DecisionReason, PacingDecision,
};
