//! Kani formal verification harnesses for margin-prog.
//!
//! Run with: `cargo kani --tests`
//!
//! These harnesses prove PROGRAM-LEVEL security properties:
//! - Delegate ABI validation rejects malformed returns and never reads them as approval
//! - Owner enforcement and burned-owner handling for the operation gate
//! - Delegate identity binding (the invoked program must be the lender of record)
//! - Loan offering cancellation never exceeds the remaining capacity
//! - Offering expiry boundary
//! - Operation gate matrix: close-directly is always allowed, nothing else in CloseDirectlyOnly
//!
//! Note: CPI execution and record account I/O are NOT modeled.

#![cfg(kani)]

extern crate kani;

use margin_prog::constants::DELEGATE_ABI_VERSION;
use margin_prog::delegate_abi::{validate_return, DelegateReturn};
use margin_prog::engine::{ActionCategory, LedgerError, OperationState};
use margin_prog::verify::{
    admin_ok, cancel_amount, clock_now, delegate_identity_ok, deposit_clears_call, offering_live,
    owner_ok, remaining_capacity,
};

// =============================================================================
// Fixtures
// =============================================================================

fn any_return() -> DelegateReturn {
    DelegateReturn {
        abi_version: kani::any(),
        approved: kani::any(),
        position_id: kani::any(),
    }
}

fn any_state() -> OperationState {
    let raw: u8 = kani::any();
    kani::assume(raw < 4);
    match raw {
        0 => OperationState::Operational,
        1 => OperationState::CloseAndCancelLoanOnly,
        2 => OperationState::CloseOnly,
        _ => OperationState::CloseDirectlyOnly,
    }
}

// =============================================================================
// A. DELEGATE ABI VALIDATION
// =============================================================================

/// Prove: wrong ABI version is always rejected
#[kani::proof]
fn kani_delegate_rejects_wrong_version() {
    let ret = any_return();
    let position_id: [u8; 32] = kani::any();
    kani::assume(ret.abi_version != DELEGATE_ABI_VERSION);

    assert_eq!(validate_return(&ret, &position_id), Err(LedgerError::InvalidDelegateResponse));
}

/// Prove: an approved byte other than 0 or 1 is rejected
#[kani::proof]
fn kani_delegate_rejects_non_boolean_flag() {
    let mut ret = any_return();
    ret.abi_version = DELEGATE_ABI_VERSION;
    kani::assume(ret.approved > 1);

    assert!(validate_return(&ret, &ret.position_id).is_err());
}

/// Prove: an answer about a different position is rejected
#[kani::proof]
fn kani_delegate_rejects_echo_mismatch() {
    let mut ret = any_return();
    ret.abi_version = DELEGATE_ABI_VERSION;
    let position_id: [u8; 32] = kani::any();
    kani::assume(ret.position_id != position_id);

    assert!(validate_return(&ret, &position_id).is_err());
}

/// Prove: Ok(true) only for a well-formed explicit approval
#[kani::proof]
fn kani_delegate_approval_requires_valid_return() {
    let ret = any_return();
    let position_id: [u8; 32] = kani::any();

    if validate_return(&ret, &position_id) == Ok(true) {
        assert_eq!(ret.abi_version, DELEGATE_ABI_VERSION);
        assert_eq!(ret.approved, 1);
        assert_eq!(ret.position_id, position_id);
    }
}

/// Prove: delegate identity binds to the lender of record
#[kani::proof]
fn kani_delegate_identity_binding() {
    let lender: [u8; 32] = kani::any();
    let provided: [u8; 32] = kani::any();

    assert_eq!(delegate_identity_ok(lender, provided), lender == provided);
}

// =============================================================================
// B. OWNER / ADMIN AUTHORIZATION
// =============================================================================

/// Prove: owner check is exact key equality
#[kani::proof]
fn kani_owner_mismatch_rejected() {
    let stored: [u8; 32] = kani::any();
    let signer: [u8; 32] = kani::any();
    kani::assume(stored != signer);

    assert!(!owner_ok(stored, signer));
}

/// Prove: a burned (zero) gate owner authorizes nobody
#[kani::proof]
fn kani_burned_admin_rejects_all() {
    let signer: [u8; 32] = kani::any();

    assert!(!admin_ok([0u8; 32], signer));
}

/// Prove: a live gate owner authorizes exactly itself
#[kani::proof]
fn kani_admin_matches_only_self() {
    let admin: [u8; 32] = kani::any();
    let signer: [u8; 32] = kani::any();
    kani::assume(admin != [0u8; 32]);

    assert_eq!(admin_ok(admin, signer), admin == signer);
}

// =============================================================================
// C. LOAN OFFERING ACCOUNTING
// =============================================================================

/// Prove: a cancellation never exceeds the request or the remaining capacity
#[kani::proof]
fn kani_cancel_amount_bounded() {
    let max: u64 = kani::any();
    let canceled: u64 = kani::any();
    let filled: u64 = kani::any();
    let requested: u64 = kani::any();

    let amount = cancel_amount(max, canceled, filled, requested);
    assert!(amount <= requested);
    assert!(amount <= remaining_capacity(max, canceled, filled));
}

/// Prove: after a cancellation within capacity, unavailable never exceeds max
#[kani::proof]
fn kani_cancel_keeps_unavailable_within_max() {
    let max: u64 = kani::any();
    let canceled: u64 = kani::any();
    let filled: u64 = kani::any();
    let requested: u64 = kani::any();
    kani::assume(canceled.checked_add(filled).map_or(false, |u| u <= max));

    let amount = cancel_amount(max, canceled, filled, requested);
    assert!(canceled + amount + filled <= max);
}

/// Prove: exhausted offerings cancel nothing
#[kani::proof]
fn kani_exhausted_offering_cancels_zero() {
    let max: u64 = kani::any();
    let canceled: u64 = kani::any();
    let filled: u64 = kani::any();
    let requested: u64 = kani::any();
    kani::assume(canceled.saturating_add(filled) >= max);

    assert_eq!(cancel_amount(max, canceled, filled, requested), 0);
}

/// Prove: expiry is strict and zero never expires
#[kani::proof]
fn kani_offering_expiry_boundary() {
    let exp: u64 = kani::any();
    let now: u64 = kani::any();

    if exp == 0 {
        assert!(offering_live(exp, now));
    } else {
        assert_eq!(offering_live(exp, now), now < exp);
    }
}

// =============================================================================
// D. MARGIN CALLS AND GATE
// =============================================================================

/// Prove: a deposit never clears a call that does not exist
#[kani::proof]
fn kani_deposit_needs_outstanding_call() {
    let required: u64 = kani::any();
    let amount: u64 = kani::any();

    assert!(!deposit_clears_call(0, required, amount));
}

/// Prove: negative clock readings map to the rejected zero timestamp
#[kani::proof]
fn kani_clock_now_non_negative() {
    let ts: i64 = kani::any();

    let now = clock_now(ts);
    if ts <= 0 {
        assert_eq!(now, 0);
    } else {
        assert_eq!(now, ts as u64);
    }
}

/// Prove: close-directly is allowed in every state, and it is the only
/// action CloseDirectlyOnly allows
#[kani::proof]
fn kani_gate_close_directly_always() {
    let state = any_state();
    assert!(state.permits(ActionCategory::ClosePositionDirectly));

    if state == OperationState::CloseDirectlyOnly {
        assert!(!state.permits(ActionCategory::OpenPosition));
        assert!(!state.permits(ActionCategory::MarginCall));
        assert!(!state.permits(ActionCategory::CancelLoanOffering));
        assert!(!state.permits(ActionCategory::ClosePosition));
    }
}

/// Prove: opening and margin calls require the Operational state
#[kani::proof]
fn kani_gate_open_and_call_only_operational() {
    let state = any_state();

    assert_eq!(state.permits(ActionCategory::OpenPosition), state == OperationState::Operational);
    assert_eq!(state.permits(ActionCategory::MarginCall), state == OperationState::Operational);
}
