//! Settlement emission: folding an account's off-chain position into
//! zero-sum instructions for the jurisdiction layer.

use xln_core::{Amount, SettlementDiff, TokenId, XlnError};

use crate::machine::AccountMachine;

/// Build the cooperative-close diff for one token.
///
/// The collateral is released and split by the current flow position: the
/// right side is owed `clamp(position, 0, C)`, the left side keeps the rest.
/// Credit beyond the collateral settles off this diff (it nets to zero by
/// construction of the invariant bounds).
pub fn close_diff(
    token_id: &TokenId,
    position: Amount,
    collateral: Amount,
) -> Result<SettlementDiff, XlnError> {
    let right_share = position.clamp(0, collateral);
    let left_share = collateral - right_share;
    SettlementDiff::new(token_id.clone(), left_share, right_share, -collateral)
}

impl AccountMachine {
    /// Cooperatively close one token: emit the zero-sum diff and fold the
    /// off-chain position back into the on-chain layer.
    pub fn cooperative_close(&mut self, token_id: &TokenId) -> Result<SettlementDiff, XlnError> {
        let delta = self
            .state
            .ledger
            .get(token_id)
            .ok_or_else(|| XlnError::UnknownEntity(token_id.to_string()))?;
        let diff = close_diff(token_id, delta.position(), delta.collateral)?;
        let net = delta.net();
        let collateral = delta.collateral;
        self.state
            .ledger
            .apply_settlement(token_id, -net, -collateral)?;
        Ok(diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xln_core::EntityId;

    use crate::machine::AccountMachine;

    fn token() -> TokenId {
        TokenId::number(1)
    }

    #[test]
    fn close_diff_is_zero_sum_across_positions() {
        for position in [-50, 0, 30, 100, 140] {
            let d = close_diff(&token(), position, 100).unwrap();
            assert_eq!(d.left_diff() + d.right_diff() + d.collateral_diff(), 0);
        }
    }

    #[test]
    fn close_splits_collateral_by_position() {
        let d = close_diff(&token(), 30, 100).unwrap();
        assert_eq!(d.left_diff(), 70);
        assert_eq!(d.right_diff(), 30);
        assert_eq!(d.collateral_diff(), -100);
    }

    #[test]
    fn cooperative_close_zeroes_the_account() {
        let mut m = AccountMachine::new(EntityId::new(*b"alice"), EntityId::new(*b"bob"));
        m.state.ledger.set_collateral(&token(), 1000).unwrap();
        m.state.ledger.update_delta(&token(), -250).unwrap();

        let diff = m.cooperative_close(&token()).unwrap();
        assert_eq!(diff.right_diff(), 250);
        assert_eq!(diff.left_diff(), 750);

        let d = m.state.ledger.get(&token()).unwrap();
        assert_eq!(d.net(), 0);
        assert_eq!(d.collateral, 0);
    }
}
