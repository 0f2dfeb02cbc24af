use clap::ValueEnum;

use parley_conversation::ModelScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliModelScope {
    Global,
    PerUser,
}

impl From<CliModelScope> for ModelScope {
    fn from(value: CliModelScope) -> Self {
        match value {
            CliModelScope::Global => ModelScope::Global,
            CliModelScope::PerUser => ModelScope::PerUser,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliWindowStrategy {
    /// Drop whole entries once the character budget is spent.
    DropWhole,
    /// Keep the tail of the entry that overflows the budget.
    TailSlice,
}
