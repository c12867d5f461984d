//! Minimal lottery contract ABI: only the calls the watchdog makes.

use alloy::sol;

sol! {
    #[sol(rpc)]
    contract Lottery {
        function endRound() external;
        function getCurrentRound() external view returns (uint256 roundId, uint256 startTime, uint256 endTime, uint256 totalTickets, uint256 prizePool, bool ended);
        function currentRoundId() external view returns (uint256);
    }
}
