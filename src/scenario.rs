//! Scenario Orchestrator
//!
//! Per token, a fixed script moves funds through every operation type and
//! checks the accounting after each step:
//!
//! 1. auto-approved deposit, depositor -> sender (`D/2`)
//! 2. approval-gated deposit, depositor -> sender (`D/2`)
//! 3. on-chain key registration of the sender (skipped if already set)
//! 4. transfer sender -> receiver, receiver is a new account
//! 5. transfer sender -> receiver, receiver now exists
//! 6. off-chain key registration of the receiver (skipped if already set)
//! 7. withdrawal receiver -> its own chain address, awaited until verified
//!
//! Tokens run one after another; the sender and depositor are shared, every
//! token gets its own fresh receiver. The first failure aborts the run.

use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::clients::LedgerClient;
use crate::config::AmountConfig;
use crate::context::{AccountRegistry, HarnessContext};
use crate::error::HarnessError;
use crate::executor::OperationExecutor;
use crate::invariants::{
    check_approval, check_deposit, check_key_registration, check_transfer, check_withdrawal,
    DepositSnapshot, TransferSnapshot, WithdrawalSnapshot,
};
use crate::models::{
    format_units, parse_units, Address, Deposit, DepositMode, KeyRegistration, KeyVariant, Operation,
    OperationKind, Stage, TokenInfo, Transfer, Withdrawal,
};
use crate::oracle::BalanceOracle;

// =============================================================================
// AMOUNTS
// =============================================================================

/// Amounts of one token's script, all derived from the deposit total `D`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioAmounts {
    /// Each of the two deposits: `D/2`.
    pub deposit: BigUint,
    /// `D/25`
    pub transfer_fee: BigUint,
    /// `D/2 - transfer_fee`
    pub transfer: BigUint,
    /// `transfer/20`
    pub withdraw_fee: BigUint,
    /// `transfer - withdraw_fee`
    pub withdraw: BigUint,
}

impl ScenarioAmounts {
    pub fn from_deposit_total(total: &BigUint) -> Self {
        let half = total / 2u32;
        let transfer_fee = total / 25u32;
        let transfer = &half - &transfer_fee;
        let withdraw_fee = &transfer / 20u32;
        let withdraw = &transfer - &withdraw_fee;
        Self {
            deposit: half,
            transfer_fee,
            transfer,
            withdraw_fee,
            withdraw,
        }
    }

    pub fn for_token(total: &str, token: &TokenInfo) -> Result<Self, HarnessError> {
        Ok(Self::from_deposit_total(&parse_units(total, token.decimals)?))
    }
}

// =============================================================================
// REPORT
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    AutoApprovedDeposit,
    ApprovedDeposit,
    OnChainKeyRegistration,
    TransferToNew,
    Transfer,
    OffChainKeyRegistration,
    Withdrawal,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::AutoApprovedDeposit => "auto approved deposit",
            Step::ApprovedDeposit => "forever approved deposit",
            Step::OnChainKeyRegistration => "change pubkey onchain",
            Step::TransferToNew => "transfer to new",
            Step::Transfer => "transfer",
            Step::OffChainKeyRegistration => "change pubkey offchain",
            Step::Withdrawal => "withdraw",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Approved,
    Posted,
    Committed,
    Verified,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Approved => f.write_str("approved"),
            Phase::Posted => f.write_str("posted"),
            Phase::Committed => f.write_str("committed"),
            Phase::Verified => f.write_str("verified"),
        }
    }
}

/// Outcome of one script step. Milliseconds are measured from step start.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub token: String,
    pub step: Step,
    pub skipped: bool,
    pub operation_id: Option<String>,
    pub approved_ms: Option<u64>,
    pub posted_ms: Option<u64>,
    pub committed_ms: Option<u64>,
    pub verified_ms: Option<u64>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepReport>,
}

impl ScenarioReport {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            steps: Vec::new(),
        }
    }

    pub fn steps_for(&self, token: &str) -> impl Iterator<Item = &StepReport> {
        let token = token.to_string();
        self.steps.iter().filter(move |s| s.token == token)
    }

    pub fn skipped(&self) -> usize {
        self.steps.iter().filter(|s| s.skipped).count()
    }
}

impl Default for ScenarioReport {
    fn default() -> Self {
        Self::new()
    }
}

struct StepTimer {
    report: StepReport,
    started: Instant,
}

impl StepTimer {
    fn start(token: &TokenInfo, step: Step) -> Self {
        Self {
            report: StepReport {
                token: token.symbol.clone(),
                step,
                skipped: false,
                operation_id: None,
                approved_ms: None,
                posted_ms: None,
                committed_ms: None,
                verified_ms: None,
                finished_at: Utc::now(),
            },
            started: Instant::now(),
        }
    }

    fn mark(&mut self, phase: Phase) {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        info!(
            token = %self.report.token,
            step = %self.report.step,
            elapsed_ms,
            "{} {}",
            self.report.step,
            phase
        );
        let slot = match phase {
            Phase::Approved => &mut self.report.approved_ms,
            Phase::Posted => &mut self.report.posted_ms,
            Phase::Committed => &mut self.report.committed_ms,
            Phase::Verified => &mut self.report.verified_ms,
        };
        *slot = Some(elapsed_ms);
    }

    fn id(&mut self, operation_id: &str) {
        self.report.operation_id = Some(operation_id.to_string());
    }

    fn finish(mut self, report: &mut ScenarioReport) {
        self.report.finished_at = Utc::now();
        info!(token = %self.report.token, "{} ok", self.report.step);
        report.steps.push(self.report);
    }

    fn skip(mut self, report: &mut ScenarioReport) {
        self.report.skipped = true;
        self.report.finished_at = Utc::now();
        info!(token = %self.report.token, "{} skipped, signing key already set", self.report.step);
        report.steps.push(self.report);
    }
}

// =============================================================================
// RUNNER
// =============================================================================

pub struct ScenarioRunner {
    ledger: Arc<dyn LedgerClient>,
    executor: OperationExecutor,
    oracle: BalanceOracle,
    accounts: Arc<AccountRegistry>,
    operator: Address,
    amounts: AmountConfig,
}

impl ScenarioRunner {
    pub fn new(ctx: &HarnessContext) -> Self {
        Self {
            ledger: ctx.ledger.clone(),
            executor: ctx.executor(),
            oracle: ctx.oracle(),
            accounts: ctx.accounts.clone(),
            operator: ctx.operator,
            amounts: ctx.config.amounts.clone(),
        }
    }

    /// Fund the depositor with native and ERC20 funds and every other party
    /// with native funds, out of the funder account.
    pub async fn prepare(&self, tokens: &[TokenInfo]) -> Result<(), HarnessError> {
        let funder = self.accounts.funder();
        let native = TokenInfo::native();
        let started = Instant::now();

        self.executor
            .fund_account(
                funder,
                self.accounts.depositor(),
                &native,
                &parse_units(&self.amounts.depositor_native, native.decimals)?,
            )
            .await?;
        for token in tokens.iter().filter(|t| !t.is_native()) {
            self.executor
                .fund_account(
                    funder,
                    self.accounts.depositor(),
                    token,
                    &parse_units(&self.amounts.depositor_erc20, token.decimals)?,
                )
                .await?;
        }

        let account_native = parse_units(&self.amounts.account_native, native.decimals)?;
        let mut parties = vec![self.accounts.sender()];
        parties.extend(self.accounts.receivers());
        for party in parties {
            self.executor
                .fund_account(funder, party, &native, &account_native)
                .await?;
        }

        info!(
            depositor = %self.accounts.depositor(),
            sender = %self.accounts.sender(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "accounts funded"
        );
        Ok(())
    }

    /// Run the script for every token, in order, with receiver `i` for token `i`.
    pub async fn run(&self, tokens: &[TokenInfo], report: &mut ScenarioReport) -> Result<(), HarnessError> {
        for (i, token) in tokens.iter().enumerate() {
            let receiver = self.accounts.receiver(i).ok_or_else(|| {
                HarnessError::Config(format!("no receiver account for token #{i} ({})", token.symbol))
            })?;
            self.run_token(token, receiver, report).await?;
        }
        report.finished_at = Some(Utc::now());
        Ok(())
    }

    /// The fixed script for one token.
    pub async fn run_token(
        &self,
        token: &TokenInfo,
        receiver: Address,
        report: &mut ScenarioReport,
    ) -> Result<(), HarnessError> {
        let amounts = ScenarioAmounts::for_token(&self.amounts.deposit, token)?;
        info!(
            token = %token.symbol,
            %receiver,
            deposit = %format_units(&amounts.deposit, token.decimals),
            transfer = %format_units(&amounts.transfer, token.decimals),
            transfer_fee = %format_units(&amounts.transfer_fee, token.decimals),
            withdraw = %format_units(&amounts.withdraw, token.decimals),
            withdraw_fee = %format_units(&amounts.withdraw_fee, token.decimals),
            "moving funds"
        );
        let sender = self.accounts.sender();

        self.deposit(token, &amounts.deposit, DepositMode::AutoApproved, report)
            .await?;
        self.approved_deposit(token, &amounts.deposit, report).await?;
        self.register_key(sender, KeyVariant::OnChain, token, report).await?;
        self.transfer(Step::TransferToNew, token, receiver, &amounts, report)
            .await?;
        self.transfer(Step::Transfer, token, receiver, &amounts, report)
            .await?;
        self.register_key(receiver, KeyVariant::OffChain, token, report)
            .await?;
        self.withdraw(token, receiver, &amounts, report).await?;
        Ok(())
    }

    async fn deposit(
        &self,
        token: &TokenInfo,
        amount: &BigUint,
        mode: DepositMode,
        report: &mut ScenarioReport,
    ) -> Result<(), HarnessError> {
        let step = match mode {
            DepositMode::AutoApproved => Step::AutoApprovedDeposit,
            DepositMode::PreApproved => Step::ApprovedDeposit,
        };
        let timer = StepTimer::start(token, step);
        self.deposit_with_timer(timer, token, amount, mode, report).await
    }

    async fn deposit_with_timer(
        &self,
        mut timer: StepTimer,
        token: &TokenInfo,
        amount: &BigUint,
        mode: DepositMode,
        report: &mut ScenarioReport,
    ) -> Result<(), HarnessError> {
        let op = Deposit {
            depositor: self.accounts.depositor(),
            target: self.accounts.sender(),
            token: token.clone(),
            amount: amount.clone(),
            mode,
        };
        let before = DepositSnapshot {
            target: self.oracle.balance_of(op.target, token, Stage::Committed).await?,
        };

        let mut handle = self.executor.submit(&Operation::Deposit(op.clone())).await?;
        timer.id(handle.id());
        timer.mark(Phase::Posted);
        handle.await_committed().await?;
        timer.mark(Phase::Committed);

        let after = DepositSnapshot {
            target: self.oracle.balance_of(op.target, token, Stage::Committed).await?,
        };
        check_deposit(&op, handle.id(), &before, &after)?;

        if mode == DepositMode::PreApproved && !token.is_native() {
            let approved = self.oracle.is_deposit_approved(op.depositor, token).await?;
            check_approval(OperationKind::Deposit, op.depositor, &token.symbol, true, approved)?;
        }
        timer.finish(report);
        Ok(())
    }

    /// Deposit under a standing approval: not approved before, approve
    /// unlimited, approved after, still approved once the deposit commits.
    async fn approved_deposit(
        &self,
        token: &TokenInfo,
        amount: &BigUint,
        report: &mut ScenarioReport,
    ) -> Result<(), HarnessError> {
        let mut timer = StepTimer::start(token, Step::ApprovedDeposit);
        if !token.is_native() {
            let depositor = self.accounts.depositor();
            let approved = self.oracle.is_deposit_approved(depositor, token).await?;
            check_approval(OperationKind::Deposit, depositor, &token.symbol, false, approved)?;

            self.executor.approve_deposits(depositor, token).await?;
            timer.mark(Phase::Approved);

            let approved = self.oracle.is_deposit_approved(depositor, token).await?;
            check_approval(OperationKind::Deposit, depositor, &token.symbol, true, approved)?;
        }
        self.deposit_with_timer(timer, token, amount, DepositMode::PreApproved, report)
            .await
    }

    async fn register_key(
        &self,
        account: Address,
        variant: KeyVariant,
        token: &TokenInfo,
        report: &mut ScenarioReport,
    ) -> Result<(), HarnessError> {
        let step = match variant {
            KeyVariant::OnChain => Step::OnChainKeyRegistration,
            KeyVariant::OffChain => Step::OffChainKeyRegistration,
        };
        let mut timer = StepTimer::start(token, step);
        if self.oracle.is_signing_key_set(account).await? {
            timer.skip(report);
            return Ok(());
        }

        let op = Operation::KeyRegistration(KeyRegistration { account, variant });
        let mut handle = self.executor.submit(&op).await?;
        timer.id(handle.id());
        timer.mark(Phase::Posted);
        handle.await_committed().await?;
        timer.mark(Phase::Committed);

        let set_after = self.oracle.is_signing_key_set(account).await?;
        check_key_registration(account, handle.id(), set_after)?;
        timer.finish(report);
        Ok(())
    }

    async fn transfer_snapshot(
        &self,
        sender: Address,
        receiver: Address,
        token: &TokenInfo,
    ) -> Result<TransferSnapshot, HarnessError> {
        Ok(TransferSnapshot {
            sender: self.oracle.balance_of(sender, token, Stage::Committed).await?,
            receiver: self.oracle.balance_of(receiver, token, Stage::Committed).await?,
            operator: self.oracle.balance_of(self.operator, token, Stage::Committed).await?,
        })
    }

    async fn transfer(
        &self,
        step: Step,
        token: &TokenInfo,
        receiver: Address,
        amounts: &ScenarioAmounts,
        report: &mut ScenarioReport,
    ) -> Result<(), HarnessError> {
        let mut timer = StepTimer::start(token, step);
        let op = Transfer {
            from: self.accounts.sender(),
            to: receiver,
            token: token.clone(),
            amount: amounts.transfer.clone(),
            fee: amounts.transfer_fee.clone(),
        };
        let before = self.transfer_snapshot(op.from, op.to, token).await?;

        let mut handle = self.executor.submit(&Operation::Transfer(op.clone())).await?;
        timer.id(handle.id());
        timer.mark(Phase::Posted);
        handle.await_committed().await?;
        timer.mark(Phase::Committed);

        let after = self.transfer_snapshot(op.from, op.to, token).await?;
        check_transfer(&op, handle.id(), &before, &after)?;
        timer.finish(report);
        Ok(())
    }

    async fn withdrawal_snapshot(&self, op: &Withdrawal) -> Result<WithdrawalSnapshot, HarnessError> {
        Ok(WithdrawalSnapshot {
            sender: self.oracle.balance_of(op.from, &op.token, Stage::Committed).await?,
            operator: self.oracle.balance_of(self.operator, &op.token, Stage::Committed).await?,
            chain_settled: self.oracle.balance_of(op.to, &op.token, Stage::Chain).await?,
            chain_pending: self.oracle.pending_withdrawal(op.to, &op.token).await?,
        })
    }

    async fn withdraw(
        &self,
        token: &TokenInfo,
        account: Address,
        amounts: &ScenarioAmounts,
        report: &mut ScenarioReport,
    ) -> Result<(), HarnessError> {
        let mut timer = StepTimer::start(token, Step::Withdrawal);
        let op = Withdrawal {
            from: account,
            to: account,
            token: token.clone(),
            amount: amounts.withdraw.clone(),
            fee: amounts.withdraw_fee.clone(),
        };
        let before = self.withdrawal_snapshot(&op).await?;

        let mut handle = self.executor.submit(&Operation::Withdrawal(op.clone())).await?;
        timer.id(handle.id());
        timer.mark(Phase::Posted);
        handle.await_verified().await?;
        timer.mark(Phase::Verified);

        let after = self.withdrawal_snapshot(&op).await?;
        debug!(
            settled = %after.chain_settled,
            pending = %after.chain_pending,
            "withdrawal destination after verification"
        );
        check_withdrawal(&op, handle.id(), &before, &after)?;
        timer.finish(report);
        Ok(())
    }

    /// Release the ledger connection.
    pub async fn disconnect(&self) {
        if let Err(e) = self.ledger.disconnect().await {
            warn!(error = %e, "ledger disconnect failed");
        }
    }
}

/// Resolve the configured tokens, fund the parties, run every token's script
/// and disconnect. The report holds every step completed before a failure.
pub async fn run_all(ctx: &HarnessContext, report: &mut ScenarioReport) -> Result<(), HarnessError> {
    let runner = ScenarioRunner::new(ctx);
    let result = async {
        let mut tokens = Vec::with_capacity(ctx.tokens.len());
        for token in &ctx.tokens {
            tokens.push(ctx.ledger.resolve_token(*token).await?);
        }
        runner.prepare(&tokens).await?;
        runner.run(&tokens, report).await
    }
    .await;
    runner.disconnect().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NATIVE_DECIMALS;

    #[test]
    fn test_amounts_follow_deposit_total() {
        let total = parse_units("0.018", NATIVE_DECIMALS).unwrap();
        let a = ScenarioAmounts::from_deposit_total(&total);
        assert_eq!(a.deposit, parse_units("0.009", 18).unwrap());
        assert_eq!(a.transfer_fee, parse_units("0.00072", 18).unwrap());
        assert_eq!(a.transfer, parse_units("0.00828", 18).unwrap());
        assert_eq!(a.withdraw_fee, parse_units("0.000414", 18).unwrap());
        assert_eq!(a.withdraw, parse_units("0.007866", 18).unwrap());

        // Two transfers drain exactly what the two deposits brought in.
        assert_eq!((&a.transfer + &a.transfer_fee) * 2u32, &a.deposit * 2u32);
        // The receiver can afford the withdrawal after both transfers.
        assert!(&a.withdraw + &a.withdraw_fee <= &a.transfer * 2u32);
    }

    #[test]
    fn test_amounts_truncate_like_integer_division() {
        let a = ScenarioAmounts::from_deposit_total(&BigUint::from(101u32));
        assert_eq!(a.deposit, BigUint::from(50u32));
        assert_eq!(a.transfer_fee, BigUint::from(4u32));
        assert_eq!(a.transfer, BigUint::from(46u32));
        assert_eq!(a.withdraw_fee, BigUint::from(2u32));
        assert_eq!(a.withdraw, BigUint::from(44u32));
    }

    #[test]
    fn test_amounts_render_in_token_units() {
        let usdc = TokenInfo {
            id: 2,
            symbol: "USDC".into(),
            address: Address([0xcc; 20]),
            decimals: 6,
        };
        let a = ScenarioAmounts::for_token("2", &usdc).unwrap();
        let rendered: Vec<String> = [&a.deposit, &a.transfer, &a.transfer_fee, &a.withdraw, &a.withdraw_fee]
            .into_iter()
            .map(|amount| format_units(amount, usdc.decimals))
            .collect();
        assert_eq!(rendered, ["1", "0.92", "0.08", "0.874", "0.046"]);
    }

    #[test]
    fn test_step_names() {
        assert_eq!(Step::TransferToNew.to_string(), "transfer to new");
        assert_eq!(Step::ApprovedDeposit.to_string(), "forever approved deposit");
        let json = serde_json::to_value(Step::OffChainKeyRegistration).unwrap();
        assert_eq!(json, "off_chain_key_registration");
    }
}
