//! Contract bindings used by the engine.
//!
//! ERC-20 covers both trade tokens and vault share tokens (an ERC-4626 vault
//! is itself an ERC-20). The two vault interfaces mirror the two deployment
//! shapes the engine supports; which one a vault speaks is configuration.

use alloy_sol_types::sol;

sol! {
    #[allow(missing_docs)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface IERC20 {
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 value) external returns (bool);
        function transferFrom(address from, address to, uint256 value) external returns (bool);
        function balanceOf(address account) external view returns (uint256);
        function decimals() external view returns (uint8);
    }
}

sol! {
    #[allow(missing_docs)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface IERC4626 {
        function deposit(uint256 assets, address receiver) external returns (uint256 shares);
        function redeem(uint256 shares, address receiver, address owner) external returns (uint256 assets);
    }
}

sol! {
    #[allow(missing_docs)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface ISimpleVault {
        function deposit(uint256 amount) external;
        function withdraw(uint256 shares) external;
    }
}
