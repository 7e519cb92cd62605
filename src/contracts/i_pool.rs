use ethers::prelude::*;

// Field order of `FundingRequest` must match the contract struct exactly:
// the tuple is ABI-decoded positionally.
abigen!(
    IPool,
    r#"[
        struct FundingRequest { uint256 id; address requester; string title; string descriptionUri; uint256 amount; uint8 requestType; uint256 rewardBps; uint256 duration; uint256 collateralAmount; address collateralToken; uint8 status; uint256 votingEndsAt; uint256 yesVotes; uint256 noVotes; uint256 fundedAt; uint256 repaidAmount; }
        event Deposited(address indexed member, uint256 amount, uint256 shares)
        event Withdrawn(address indexed member, uint256 amount, uint256 shares)
        event MemberWhitelisted(address indexed member)
        event GuardianAdded(address indexed guardian)
        event RequestCreated(uint256 indexed requestId, address indexed requester, uint256 amount, uint8 requestType)
        event VoteCast(uint256 indexed requestId, address indexed voter, bool support, uint256 weight)
        event RequestApproved(uint256 indexed requestId)
        event RequestRejected(uint256 indexed requestId)
        event RequestFunded(uint256 indexed requestId, address indexed requester, uint256 amount)
        event GuardianApproval(uint256 indexed requestId, address indexed guardian)
        function config() external view returns (string name, address depositToken, uint256 minDeposit, uint256 votingPeriod, uint256 quorumBps, uint256 approvalThresholdBps, uint256 guardianThresholdBps)
        function admin() external view returns (address)
        function totalDeposited() external view returns (uint256)
        function shareToken() external view returns (address)
        function members(address) external view returns (bool isActive, bool isGuardian, uint256 joinedAt)
        function nextRequestId() external view returns (uint256)
        function getRequest(uint256 requestId) external view returns (FundingRequest)
    ]"#
);
