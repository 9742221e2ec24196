use ethers::prelude::*;

// Batch settlement contract: checks each voucher's EIP-712 signature against its own
// payer and amount, consumes its nonce, and pulls the tokens to the payee.
abigen!(
    DeferredSettlement,
    r#"[
        function settleVouchers(address[] payers, address payee, uint256[] amounts, bytes[] nonces, uint256[] validUntils, bytes[] signatures) external returns (uint256)
        event VouchersSettled(address indexed payee, uint256 totalAmount, uint256 voucherCount)
    ]"#
);
