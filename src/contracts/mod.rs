//! On-chain contract ABI definitions
//!
//! Uses alloy's sol! macro to generate type-safe bindings for the ERC-20
//! token interface and the batch payout router.

#![allow(clippy::too_many_arguments)]

use alloy::sol;

sol! {
    /// Minimal ERC-20 interface for token payouts and balance checks
    #[sol(rpc)]
    contract ERC20 {
        function transfer(address to, uint256 amount) external returns (bool);
        function balanceOf(address account) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
        function allowance(address owner, address spender) external view returns (uint256);
        function decimals() external view returns (uint8);
    }

    /// Batch payout router used by the batch sequencer path.
    ///
    /// `transfers` fans a single payable call out to many recipients;
    /// `transferTokens` does the same for an ERC-20 after approval.
    #[sol(rpc)]
    contract OrbiterRouterV3 {
        function transfers(address[] calldata tos, uint256[] calldata values) external payable;
        function transferTokens(address token, address[] calldata tos, uint256[] calldata values) external;
    }
}
