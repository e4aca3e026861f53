//! Margin ledger engine.
//!
//! Account-agnostic state machine behind the program: the operation gate,
//! hash-keyed loan-offering accounting, the position store and the
//! margin-call transitions. The engine itself holds only the gate; each
//! offering record and each position is a separate record handed in by the
//! caller, one per key. Every operation finishes validating before its
//! first write, so an `Err` never leaves partial state behind.

use bytemuck::{Pod, Zeroable};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use solana_program::hash::hashv;
use thiserror::Error;

use crate::verify;

/// Raw operation-state value reserved as the rejection sentinel.
pub const INVALID_OPERATION_STATE: u8 = 4;

const OFFERING_DOMAIN: &[u8] = b"margin-prog/loan-offering/v1";
const POSITION_DOMAIN: &[u8] = b"margin-prog/position/v1";

pub type Key = [u8; 32];
pub type LoanHash = [u8; 32];
pub type PositionId = [u8; 32];

// ============================================================================
// Errors
// ============================================================================

/// Failure classes surfaced to callers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Authorization,
    StateGate,
    Validation,
    Expired,
    AlreadyCalled,
    NotCalled,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum LedgerError {
    #[error("caller is not authorized for this action")]
    Unauthorized,
    #[error("action is not permitted in the current operation state")]
    OperationNotPermitted,
    #[error("operation state value is out of range")]
    InvalidOperationState,
    #[error("loan offering has expired")]
    LoanOfferingExpired,
    #[error("position is already margin-called")]
    AlreadyCalled,
    #[error("position is not margin-called")]
    NotCalled,
    #[error("position does not exist")]
    PositionNotFound,
    #[error("position already exists")]
    PositionExists,
    #[error("loan offering cannot cover the requested principal")]
    InsufficientLoanCapacity,
    #[error("amount must be non-zero")]
    ZeroAmount,
    #[error("ledger record belongs to a different key")]
    RecordMismatch,
    #[error("clock reading is not usable as a call timestamp")]
    InvalidTimestamp,
    #[error("arithmetic overflow")]
    Overflow,
    #[error("lender kind is not recognized")]
    InvalidLenderKind,
    #[error("delegate program does not match the position lender")]
    DelegateMismatch,
    #[error("delegate program invocation failed")]
    DelegateCallFailed,
    #[error("delegate program returned a malformed response")]
    InvalidDelegateResponse,
}

impl LedgerError {
    pub fn kind(self) -> ErrorKind {
        match self {
            LedgerError::Unauthorized
            | LedgerError::DelegateMismatch
            | LedgerError::DelegateCallFailed => ErrorKind::Authorization,
            LedgerError::OperationNotPermitted => ErrorKind::StateGate,
            LedgerError::LoanOfferingExpired => ErrorKind::Expired,
            LedgerError::AlreadyCalled => ErrorKind::AlreadyCalled,
            LedgerError::NotCalled => ErrorKind::NotCalled,
            LedgerError::InvalidOperationState
            | LedgerError::PositionNotFound
            | LedgerError::PositionExists
            | LedgerError::InsufficientLoanCapacity
            | LedgerError::ZeroAmount
            | LedgerError::RecordMismatch
            | LedgerError::InvalidTimestamp
            | LedgerError::Overflow
            | LedgerError::InvalidLenderKind
            | LedgerError::InvalidDelegateResponse => ErrorKind::Validation,
        }
    }
}

// ============================================================================
// Operation gate
// ============================================================================

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive)]
pub enum OperationState {
    Operational = 0,
    CloseAndCancelLoanOnly = 1,
    CloseOnly = 2,
    CloseDirectlyOnly = 3,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ActionCategory {
    OpenPosition,
    /// Margin call, margin-call cancellation and collateral deposit.
    MarginCall,
    CancelLoanOffering,
    /// Close through an externally matched exchange order.
    ClosePosition,
    ClosePositionDirectly,
}

impl ActionCategory {
    pub const ALL: [ActionCategory; 5] = [
        ActionCategory::OpenPosition,
        ActionCategory::MarginCall,
        ActionCategory::CancelLoanOffering,
        ActionCategory::ClosePosition,
        ActionCategory::ClosePositionDirectly,
    ];
}

impl OperationState {
    pub const ALL: [OperationState; 4] = [
        OperationState::Operational,
        OperationState::CloseAndCancelLoanOnly,
        OperationState::CloseOnly,
        OperationState::CloseDirectlyOnly,
    ];

    pub fn from_raw(raw: u8) -> Result<Self, LedgerError> {
        Self::from_u8(raw).ok_or(LedgerError::InvalidOperationState)
    }

    /// Permission matrix: each state admits a fixed set of action categories.
    pub const fn permits(self, action: ActionCategory) -> bool {
        match action {
            ActionCategory::OpenPosition | ActionCategory::MarginCall => {
                matches!(self, OperationState::Operational)
            }
            ActionCategory::CancelLoanOffering => matches!(
                self,
                OperationState::Operational | OperationState::CloseAndCancelLoanOnly
            ),
            ActionCategory::ClosePosition => !matches!(self, OperationState::CloseDirectlyOnly),
            ActionCategory::ClosePositionDirectly => true,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct OperationGate {
    /// All zeroes once ownership is burned.
    pub owner: Key,
    pub state: u8,
    pub _padding: [u8; 7],
}

impl OperationGate {
    pub fn new(owner: Key) -> Self {
        Self {
            owner,
            state: OperationState::Operational as u8,
            _padding: [0; 7],
        }
    }

    /// A corrupted byte reads as the most restrictive state.
    pub fn state(&self) -> OperationState {
        OperationState::from_u8(self.state).unwrap_or(OperationState::CloseDirectlyOnly)
    }

    pub fn permits(&self, action: ActionCategory) -> bool {
        self.state().permits(action)
    }

    pub fn require(&self, action: ActionCategory) -> Result<(), LedgerError> {
        if !self.permits(action) {
            return Err(LedgerError::OperationNotPermitted);
        }
        Ok(())
    }

    /// Owner-only state change. Writing the current state is a silent no-op.
    pub fn set_state(&mut self, raw: u8, caller: &Key) -> Result<Option<MarginEvent>, LedgerError> {
        if !verify::admin_ok(self.owner, *caller) {
            return Err(LedgerError::Unauthorized);
        }
        let to = OperationState::from_raw(raw)?;
        let from = self.state();
        if from == to && self.state == raw {
            return Ok(None);
        }
        self.state = to as u8;
        Ok(Some(MarginEvent::OperationStateChanged { from, to }))
    }

    pub fn transfer_ownership(&mut self, new_owner: Key, caller: &Key) -> Result<Option<MarginEvent>, LedgerError> {
        if !verify::admin_ok(self.owner, *caller) {
            return Err(LedgerError::Unauthorized);
        }
        if new_owner == self.owner {
            return Ok(None);
        }
        let previous = self.owner;
        self.owner = new_owner;
        Ok(Some(MarginEvent::OwnershipTransferred { previous, owner: new_owner }))
    }
}

// ============================================================================
// Lenders and loan offerings
// ============================================================================

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive)]
pub enum LenderKind {
    Principal = 0,
    Delegate = 1,
}

/// Who may act for a loan: a signing principal, or a delegate program that
/// answers approval queries for it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LenderRef {
    Principal(Key),
    Delegate(Key),
}

impl LenderRef {
    pub fn from_parts(kind: u8, key: Key) -> Result<Self, LedgerError> {
        match LenderKind::from_u8(kind) {
            Some(LenderKind::Principal) => Ok(LenderRef::Principal(key)),
            Some(LenderKind::Delegate) => Ok(LenderRef::Delegate(key)),
            None => Err(LedgerError::InvalidLenderKind),
        }
    }

    pub fn kind(&self) -> LenderKind {
        match self {
            LenderRef::Principal(_) => LenderKind::Principal,
            LenderRef::Delegate(_) => LenderKind::Delegate,
        }
    }

    pub fn key(&self) -> &Key {
        match self {
            LenderRef::Principal(key) | LenderRef::Delegate(key) => key,
        }
    }
}

/// Lender-authored terms a trader may draw against. Never stored; the
/// ledger only keeps an [`OfferingRecord`] keyed by [`LoanOffering::hash`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LoanOffering {
    /// Lender principal funding the loan.
    pub payer: Key,
    /// Lender of record for positions opened against this offering.
    pub owner: LenderRef,
    pub max_amount: u64,
    pub interest_rate: u32,
    pub interest_period: u32,
    /// Zero never expires.
    pub expiration_timestamp: u64,
    pub salt: u64,
}

impl LoanOffering {
    pub fn hash(&self) -> LoanHash {
        hashv(&[
            OFFERING_DOMAIN,
            &self.payer,
            &[self.owner.kind() as u8],
            self.owner.key(),
            &self.max_amount.to_le_bytes(),
            &self.interest_rate.to_le_bytes(),
            &self.interest_period.to_le_bytes(),
            &self.expiration_timestamp.to_le_bytes(),
            &self.salt.to_le_bytes(),
        ])
        .to_bytes()
    }

    pub fn is_live(&self, now: u64) -> bool {
        verify::offering_live(self.expiration_timestamp, now)
    }
}

/// Per-offering accounting. A zeroed record is unbound and reads as empty;
/// the first write binds it to an offering hash for good.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Pod, Zeroable)]
pub struct OfferingRecord {
    pub hash: LoanHash,
    /// Only ever grows.
    pub canceled_amount: u64,
    /// Written by the open-position path only.
    pub filled_amount: u64,
}

impl OfferingRecord {
    pub fn empty(hash: LoanHash) -> Self {
        Self { hash, canceled_amount: 0, filled_amount: 0 }
    }

    pub fn is_bound(&self) -> bool {
        self.hash != [0u8; 32]
    }

    /// Accounting for `hash` as seen through this record. Unbound records
    /// and records of other offerings read as empty.
    pub fn view(&self, hash: &LoanHash) -> OfferingRecord {
        if &self.hash == hash {
            *self
        } else {
            Self::empty(*hash)
        }
    }

    pub fn unavailable_amount(&self) -> u64 {
        self.canceled_amount.saturating_add(self.filled_amount)
    }

    fn check_key(&self, hash: &LoanHash) -> Result<(), LedgerError> {
        if self.is_bound() && &self.hash != hash {
            return Err(LedgerError::RecordMismatch);
        }
        Ok(())
    }
}

// ============================================================================
// Positions
// ============================================================================

/// One position record. A zeroed record (`used == 0`) is an empty slot.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Position {
    pub id: PositionId,
    pub lender: Key,
    pub owner: Key,
    pub loan_hash: LoanHash,
    pub principal: u64,
    pub collateral: u64,
    /// Zero while not called.
    pub call_timestamp: u64,
    pub required_deposit: u64,
    pub start_timestamp: u64,
    pub lender_kind: u8,
    pub used: u8,
    pub _padding: [u8; 6],
}

impl Position {
    pub fn is_used(&self) -> bool {
        self.used != 0
    }

    pub fn is_called(&self) -> bool {
        self.call_timestamp != 0
    }

    pub fn lender_ref(&self) -> Result<LenderRef, LedgerError> {
        LenderRef::from_parts(self.lender_kind, self.lender)
    }

    fn check_key(&self, id: &PositionId) -> Result<(), LedgerError> {
        if !self.is_used() || &self.id != id {
            return Err(LedgerError::PositionNotFound);
        }
        Ok(())
    }
}

pub fn position_id(owner: &Key, nonce: u64) -> PositionId {
    hashv(&[POSITION_DOMAIN, owner, &nonce.to_le_bytes()]).to_bytes()
}

// ============================================================================
// Delegated authorization
// ============================================================================

/// Approval queries answered by a delegate lender. Each direction is
/// approved independently.
pub trait MarginCallDelegate {
    fn approve_initiate(
        &self,
        delegate: &Key,
        caller: &Key,
        position_id: &PositionId,
        required_deposit: u64,
    ) -> Result<bool, LedgerError>;

    fn approve_cancel(
        &self,
        delegate: &Key,
        caller: &Key,
        position_id: &PositionId,
    ) -> Result<bool, LedgerError>;
}

/// Resolver for contexts where no delegate program is reachable: every
/// query is denied.
pub struct NoDelegates;

impl MarginCallDelegate for NoDelegates {
    fn approve_initiate(&self, _: &Key, _: &Key, _: &PositionId, _: u64) -> Result<bool, LedgerError> {
        Ok(false)
    }

    fn approve_cancel(&self, _: &Key, _: &Key, _: &PositionId) -> Result<bool, LedgerError> {
        Ok(false)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallAction {
    Initiate { required_deposit: u64 },
    Cancel,
}

/// Decides whether `caller` may act for `lender`. A principal must be the
/// caller; a delegate's answer is final and the former principal keeps no
/// rights of its own.
pub fn authorize<D: MarginCallDelegate + ?Sized>(
    lender: &LenderRef,
    caller: &Key,
    position_id: &PositionId,
    action: CallAction,
    delegates: &D,
) -> Result<(), LedgerError> {
    let approved = match lender {
        LenderRef::Principal(key) => verify::owner_ok(*key, *caller),
        LenderRef::Delegate(program) => match action {
            CallAction::Initiate { required_deposit } => {
                delegates.approve_initiate(program, caller, position_id, required_deposit)?
            }
            CallAction::Cancel => delegates.approve_cancel(program, caller, position_id)?,
        },
    };
    if !approved {
        return Err(LedgerError::Unauthorized);
    }
    Ok(())
}

// ============================================================================
// Events
// ============================================================================

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MarginEvent {
    OperationStateChanged {
        from: OperationState,
        to: OperationState,
    },
    OwnershipTransferred {
        previous: Key,
        owner: Key,
    },
    LoanOfferingCanceled {
        loan_hash: LoanHash,
        payer: Key,
        canceled_amount: u64,
        total_canceled: u64,
        unavailable_amount: u64,
    },
    PositionOpened {
        position_id: PositionId,
        trader: Key,
        lender: LenderRef,
        loan_hash: LoanHash,
        principal: u64,
        collateral: u64,
    },
    MarginCallInitiated {
        position_id: PositionId,
        lender: Key,
        owner: Key,
        required_deposit: u64,
    },
    MarginCallCanceled {
        position_id: PositionId,
        lender: Key,
        owner: Key,
        deposit_amount: u64,
    },
    CollateralDeposited {
        position_id: PositionId,
        owner: Key,
        amount: u64,
        collateral: u64,
    },
    PositionClosed {
        position_id: PositionId,
        owner: Key,
        lender: Key,
        principal: u64,
        collateral: u64,
    },
    LoanTransferred {
        position_id: PositionId,
        from: Key,
        to: LenderRef,
    },
    PositionTransferred {
        position_id: PositionId,
        from: Key,
        to: Key,
    },
}

impl MarginEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MarginEvent::OperationStateChanged { .. } => "OperationStateChanged",
            MarginEvent::OwnershipTransferred { .. } => "OwnershipTransferred",
            MarginEvent::LoanOfferingCanceled { .. } => "LoanOfferingCanceled",
            MarginEvent::PositionOpened { .. } => "PositionOpened",
            MarginEvent::MarginCallInitiated { .. } => "MarginCallInitiated",
            MarginEvent::MarginCallCanceled { .. } => "MarginCallCanceled",
            MarginEvent::CollateralDeposited { .. } => "CollateralDeposited",
            MarginEvent::PositionClosed { .. } => "PositionClosed",
            MarginEvent::LoanTransferred { .. } => "LoanTransferred",
            MarginEvent::PositionTransferred { .. } => "PositionTransferred",
        }
    }
}

// ============================================================================
// Operation outcomes
// ============================================================================

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LoanCancellation {
    pub loan_hash: LoanHash,
    /// Amount actually canceled by this call; zero means nothing changed.
    pub canceled: u64,
    pub event: Option<MarginEvent>,
}

#[derive(Clone, Copy, Debug)]
pub struct OpenRequest {
    pub offering: LoanOffering,
    pub trader: Key,
    pub principal: u64,
    pub collateral: u64,
    pub nonce: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Deposit {
    pub event: MarginEvent,
    /// Present when the deposit satisfied an outstanding call.
    pub call_canceled: Option<MarginEvent>,
}

#[derive(Clone, Copy, Debug)]
pub struct ClosedPosition {
    pub position: Position,
    pub event: MarginEvent,
}

// ============================================================================
// Engine
// ============================================================================

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct MarginEngine {
    pub gate: OperationGate,
}

impl MarginEngine {
    pub fn new(owner: Key) -> Self {
        Self { gate: OperationGate::new(owner) }
    }

    pub fn init(&mut self, owner: Key) {
        *self = Self::new(owner);
    }

    pub fn operation_state(&self) -> OperationState {
        self.gate.state()
    }

    pub fn set_operation_state(&mut self, raw: u8, caller: &Key) -> Result<Option<MarginEvent>, LedgerError> {
        self.gate.set_state(raw, caller)
    }

    pub fn transfer_ownership(&mut self, new_owner: Key, caller: &Key) -> Result<Option<MarginEvent>, LedgerError> {
        self.gate.transfer_ownership(new_owner, caller)
    }

    // --- Loan offering ledger ---

    /// Withdraws up to `requested` of the offering's unused capacity.
    /// Saturates silently: asking for more than remains, or for zero, is
    /// not an error and leaves `record` untouched.
    pub fn cancel_loan_offering(
        &self,
        record: &mut OfferingRecord,
        offering: &LoanOffering,
        requested: u64,
        caller: &Key,
        now: u64,
    ) -> Result<LoanCancellation, LedgerError> {
        self.gate.require(ActionCategory::CancelLoanOffering)?;
        if !verify::owner_ok(offering.payer, *caller) {
            return Err(LedgerError::Unauthorized);
        }
        if !offering.is_live(now) {
            return Err(LedgerError::LoanOfferingExpired);
        }

        let loan_hash = offering.hash();
        record.check_key(&loan_hash)?;
        let current = record.view(&loan_hash);
        let amount = verify::cancel_amount(
            offering.max_amount,
            current.canceled_amount,
            current.filled_amount,
            requested,
        );
        if amount == 0 {
            return Ok(LoanCancellation { loan_hash, canceled: 0, event: None });
        }
        let total_canceled = current
            .canceled_amount
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;

        *record = OfferingRecord { canceled_amount: total_canceled, ..current };

        Ok(LoanCancellation {
            loan_hash,
            canceled: amount,
            event: Some(MarginEvent::LoanOfferingCanceled {
                loan_hash,
                payer: offering.payer,
                canceled_amount: amount,
                total_canceled,
                unavailable_amount: record.unavailable_amount(),
            }),
        })
    }

    // --- Position store ---

    /// Draws `principal` from the offering into the empty `slot`, owned by
    /// the trader; the offering's owner becomes the position's lender.
    pub fn open_position(
        &self,
        record: &mut OfferingRecord,
        slot: &mut Position,
        req: &OpenRequest,
        now: u64,
    ) -> Result<MarginEvent, LedgerError> {
        self.gate.require(ActionCategory::OpenPosition)?;
        if !req.offering.is_live(now) {
            return Err(LedgerError::LoanOfferingExpired);
        }
        if req.principal == 0 {
            return Err(LedgerError::ZeroAmount);
        }

        let loan_hash = req.offering.hash();
        record.check_key(&loan_hash)?;
        let current = record.view(&loan_hash);
        let remaining = verify::remaining_capacity(
            req.offering.max_amount,
            current.canceled_amount,
            current.filled_amount,
        );
        if req.principal > remaining {
            return Err(LedgerError::InsufficientLoanCapacity);
        }
        let filled = current
            .filled_amount
            .checked_add(req.principal)
            .ok_or(LedgerError::Overflow)?;

        let id = position_id(&req.trader, req.nonce);
        if slot.is_used() {
            return Err(LedgerError::PositionExists);
        }

        *record = OfferingRecord { filled_amount: filled, ..current };

        let lender = req.offering.owner;
        *slot = Position {
            id,
            lender: *lender.key(),
            owner: req.trader,
            loan_hash,
            principal: req.principal,
            collateral: req.collateral,
            call_timestamp: 0,
            required_deposit: 0,
            start_timestamp: now,
            lender_kind: lender.kind() as u8,
            used: 1,
            _padding: [0; 6],
        };

        Ok(MarginEvent::PositionOpened {
            position_id: id,
            trader: req.trader,
            lender,
            loan_hash,
            principal: req.principal,
            collateral: req.collateral,
        })
    }

    pub fn deposit_collateral(
        &self,
        id: &PositionId,
        position: &mut Position,
        amount: u64,
        caller: &Key,
    ) -> Result<Deposit, LedgerError> {
        self.gate.require(ActionCategory::MarginCall)?;
        position.check_key(id)?;
        if !verify::owner_ok(position.owner, *caller) {
            return Err(LedgerError::Unauthorized);
        }
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        let collateral = position
            .collateral
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;
        let clears_call = verify::deposit_clears_call(
            position.call_timestamp,
            position.required_deposit,
            amount,
        );

        position.collateral = collateral;
        if clears_call {
            position.call_timestamp = 0;
            position.required_deposit = 0;
        }

        Ok(Deposit {
            event: MarginEvent::CollateralDeposited {
                position_id: *id,
                owner: position.owner,
                amount,
                collateral,
            },
            call_canceled: clears_call.then_some(MarginEvent::MarginCallCanceled {
                position_id: *id,
                lender: position.lender,
                owner: position.owner,
                deposit_amount: amount,
            }),
        })
    }

    /// Empties the slot and hands back the record so the caller can release
    /// the collateral it held.
    pub fn close_position_directly(
        &self,
        id: &PositionId,
        position: &mut Position,
        caller: &Key,
    ) -> Result<ClosedPosition, LedgerError> {
        self.gate.require(ActionCategory::ClosePositionDirectly)?;
        position.check_key(id)?;
        if !verify::owner_ok(position.owner, *caller) {
            return Err(LedgerError::Unauthorized);
        }

        let closed = *position;
        *position = Position::zeroed();

        Ok(ClosedPosition {
            position: closed,
            event: MarginEvent::PositionClosed {
                position_id: *id,
                owner: closed.owner,
                lender: closed.lender,
                principal: closed.principal,
                collateral: closed.collateral,
            },
        })
    }

    pub fn transfer_loan(
        &self,
        id: &PositionId,
        position: &mut Position,
        new_lender: LenderRef,
        caller: &Key,
    ) -> Result<Option<MarginEvent>, LedgerError> {
        position.check_key(id)?;
        if !verify::owner_ok(position.lender, *caller) {
            return Err(LedgerError::Unauthorized);
        }
        if position.lender_ref()? == new_lender {
            return Ok(None);
        }

        let from = position.lender;
        position.lender = *new_lender.key();
        position.lender_kind = new_lender.kind() as u8;

        Ok(Some(MarginEvent::LoanTransferred { position_id: *id, from, to: new_lender }))
    }

    pub fn transfer_position(
        &self,
        id: &PositionId,
        position: &mut Position,
        new_owner: Key,
        caller: &Key,
    ) -> Result<Option<MarginEvent>, LedgerError> {
        position.check_key(id)?;
        if !verify::owner_ok(position.owner, *caller) {
            return Err(LedgerError::Unauthorized);
        }
        if position.owner == new_owner {
            return Ok(None);
        }

        let from = position.owner;
        position.owner = new_owner;

        Ok(Some(MarginEvent::PositionTransferred { position_id: *id, from, to: new_owner }))
    }

    // --- Margin calls ---

    /// UNCALLED -> CALLED. `now` becomes the call timestamp, so it must be
    /// non-zero.
    pub fn margin_call<D: MarginCallDelegate + ?Sized>(
        &self,
        id: &PositionId,
        position: &mut Position,
        required_deposit: u64,
        caller: &Key,
        now: u64,
        delegates: &D,
    ) -> Result<MarginEvent, LedgerError> {
        self.gate.require(ActionCategory::MarginCall)?;
        position.check_key(id)?;
        let lender = position.lender_ref()?;
        authorize(&lender, caller, id, CallAction::Initiate { required_deposit }, delegates)?;
        if position.is_called() {
            return Err(LedgerError::AlreadyCalled);
        }
        if now == 0 {
            return Err(LedgerError::InvalidTimestamp);
        }

        position.call_timestamp = now;
        position.required_deposit = required_deposit;

        Ok(MarginEvent::MarginCallInitiated {
            position_id: *id,
            lender: position.lender,
            owner: position.owner,
            required_deposit,
        })
    }

    /// CALLED -> UNCALLED.
    pub fn cancel_margin_call<D: MarginCallDelegate + ?Sized>(
        &self,
        id: &PositionId,
        position: &mut Position,
        caller: &Key,
        delegates: &D,
    ) -> Result<MarginEvent, LedgerError> {
        self.gate.require(ActionCategory::MarginCall)?;
        position.check_key(id)?;
        let lender = position.lender_ref()?;
        authorize(&lender, caller, id, CallAction::Cancel, delegates)?;
        if !position.is_called() {
            return Err(LedgerError::NotCalled);
        }

        position.call_timestamp = 0;
        position.required_deposit = 0;

        Ok(MarginEvent::MarginCallCanceled {
            position_id: *id,
            lender: position.lender,
            owner: position.owner,
            deposit_amount: 0,
        })
    }
}
