use std::fmt;

use serde::{Deserialize, Serialize};

/// Kinds of wallet transactions that may need a broadcaster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    ApproveShield,
    ApproveSpender,
    Mint,
    Cancel,
    Shield,
    Send,
    FarmDeposit,
    FarmRedeem,
    AddLiquidity,
    RemoveLiquidity,
    Swap,
    Unshield,
}

impl TransactionType {
    pub const ALL: [TransactionType; 12] = [
        TransactionType::ApproveShield,
        TransactionType::ApproveSpender,
        TransactionType::Mint,
        TransactionType::Cancel,
        TransactionType::Shield,
        TransactionType::Send,
        TransactionType::FarmDeposit,
        TransactionType::FarmRedeem,
        TransactionType::AddLiquidity,
        TransactionType::RemoveLiquidity,
        TransactionType::Swap,
        TransactionType::Unshield,
    ];

    /// Public transactions are submitted from the user's own wallet; only private ones (and
    /// unshields, which are always private on the spend side) go through a broadcaster.
    pub fn requires_broadcaster(self, is_private: bool) -> bool {
        match self {
            TransactionType::ApproveShield
            | TransactionType::ApproveSpender
            | TransactionType::Mint
            | TransactionType::Cancel
            | TransactionType::Shield => false,
            TransactionType::Send
            | TransactionType::FarmDeposit
            | TransactionType::FarmRedeem
            | TransactionType::AddLiquidity
            | TransactionType::RemoveLiquidity
            | TransactionType::Swap => is_private,
            TransactionType::Unshield => true,
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
