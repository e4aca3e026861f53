use bytemuck::Zeroable;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use margin_prog::engine::{
    position_id, Key, LenderRef, LoanHash, LoanOffering, MarginCallDelegate, LedgerError,
    MarginEngine, OfferingRecord, OpenRequest, OperationState, Position, PositionId,
};
use std::collections::HashMap;

const OWNER: Key = [1; 32];
const DELEGATE_PROGRAM: Key = [0xde; 32];

/// Approves callers whose first key byte is even.
struct ParityDelegate;

impl MarginCallDelegate for ParityDelegate {
    fn approve_initiate(&self, delegate: &Key, caller: &Key, _: &PositionId, _: u64) -> Result<bool, LedgerError> {
        if delegate != &DELEGATE_PROGRAM {
            return Err(LedgerError::DelegateMismatch);
        }
        Ok(caller[0] % 2 == 0)
    }

    fn approve_cancel(&self, delegate: &Key, caller: &Key, _: &PositionId) -> Result<bool, LedgerError> {
        if delegate != &DELEGATE_PROGRAM {
            return Err(LedgerError::DelegateMismatch);
        }
        Ok(caller[0] % 2 == 0)
    }
}

/// Record accounts keyed the way the program derives their addresses.
#[derive(Default)]
struct Books {
    offerings: HashMap<LoanHash, OfferingRecord>,
    positions: HashMap<PositionId, Position>,
}

impl Books {
    fn offering(&self, hash: &LoanHash) -> OfferingRecord {
        self.offerings.get(hash).map_or(OfferingRecord::empty(*hash), |r| r.view(hash))
    }

    fn position(&self, id: &PositionId) -> Option<Position> {
        self.positions.get(id).filter(|p| p.is_used()).copied()
    }

    /// Runs `f` against a copy of the position and keeps it only on success,
    /// like an instruction whose writes revert on error.
    fn with_position<T>(
        &mut self,
        id: &PositionId,
        f: impl FnOnce(&mut Position) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut p = self.positions.get(id).copied().unwrap_or_else(Position::zeroed);
        let out = f(&mut p)?;
        if p.is_used() {
            self.positions.insert(*id, p);
        } else {
            self.positions.remove(id);
        }
        Ok(out)
    }
}

fn key(b: u8) -> Key {
    [b; 32]
}

fn offerings() -> Vec<LoanOffering> {
    (0u8..6)
        .map(|i| LoanOffering {
            payer: key(10 + i),
            owner: if i % 2 == 0 {
                LenderRef::Principal(key(10 + i))
            } else {
                LenderRef::Delegate(DELEGATE_PROGRAM)
            },
            max_amount: 50_000 * (i as u64 + 1),
            interest_rate: 100,
            interest_period: 86_400,
            expiration_timestamp: if i == 5 { 1_500 } else { 0 },
            salt: i as u64,
        })
        .collect()
}

fn check_invariants(books: &Books, offers: &[LoanOffering], canceled: &HashMap<LoanHash, u64>, step: usize) {
    for o in offers {
        let h = o.hash();
        let record = books.offering(&h);
        assert!(record.unavailable_amount() <= o.max_amount, "capacity exceeded at step {}", step);
        let prev = canceled.get(&h).copied().unwrap_or(0);
        assert!(record.canceled_amount >= prev, "canceled amount shrank at step {}", step);
    }
    for (id, p) in &books.positions {
        assert_eq!(&p.id, id, "position stored under a foreign key at step {}", step);
        if p.call_timestamp == 0 {
            assert_eq!(p.required_deposit, 0, "uncalled position carries a deposit at step {}", step);
        }
    }
}

#[test]
fn deterministic_fuzz_simulation() {
    let seed = [0xabu8; 16];
    let mut rng = XorShiftRng::from_seed(seed);
    let mut engine = MarginEngine::new(OWNER);
    let mut books = Books::default();
    let offers = offerings();
    let mut canceled: HashMap<LoanHash, u64> = HashMap::new();
    let mut ids: Vec<PositionId> = Vec::new();

    for i in 0..2_000 {
        let op: u8 = rng.gen_range(0..8);
        let now = 1_000 + i as u64;

        match op {
            0 => { // Open
                let o = offers[rng.gen_range(0..offers.len())];
                let trader = key(rng.gen_range(100..110));
                let nonce = rng.gen_range(0..20);
                let req = OpenRequest {
                    offering: o,
                    trader,
                    principal: rng.gen_range(0..40_000),
                    collateral: rng.gen_range(0..5_000),
                    nonce,
                };
                let id = position_id(&trader, nonce);
                let mut record = books.offerings.get(&o.hash()).copied().unwrap_or_else(OfferingRecord::zeroed);
                let mut slot = books.positions.get(&id).copied().unwrap_or_else(Position::zeroed);
                if engine.open_position(&mut record, &mut slot, &req, now).is_ok() {
                    books.offerings.insert(o.hash(), record);
                    books.positions.insert(id, slot);
                    ids.push(id);
                }
            },
            1 => { // Cancel offering (sometimes by a stranger)
                let o = offers[rng.gen_range(0..offers.len())];
                let caller = if rng.gen_bool(0.8) { o.payer } else { key(99) };
                let mut record = books.offerings.get(&o.hash()).copied().unwrap_or_else(OfferingRecord::zeroed);
                if let Ok(c) = engine.cancel_loan_offering(&mut record, &o, rng.gen_range(0..60_000), &caller, now) {
                    if c.canceled > 0 {
                        books.offerings.insert(o.hash(), record);
                    }
                }
            },
            2 | 3 => { // Margin call
                if !ids.is_empty() {
                    let id = ids[rng.gen_range(0..ids.len())];
                    let caller = key(rng.gen_range(10..16));
                    let deposit = rng.gen_range(0..3_000);
                    let _ = books.with_position(&id, |p| engine.margin_call(&id, p, deposit, &caller, now, &ParityDelegate));
                }
            },
            4 => { // Cancel call
                if !ids.is_empty() {
                    let id = ids[rng.gen_range(0..ids.len())];
                    let caller = key(rng.gen_range(10..16));
                    let _ = books.with_position(&id, |p| engine.cancel_margin_call(&id, p, &caller, &ParityDelegate));
                }
            },
            5 => { // Deposit
                if !ids.is_empty() {
                    let id = ids[rng.gen_range(0..ids.len())];
                    if let Some(owner) = books.position(&id).map(|p| p.owner) {
                        let amount = rng.gen_range(0..4_000);
                        let _ = books.with_position(&id, |p| engine.deposit_collateral(&id, p, amount, &owner));
                    }
                }
            },
            6 => { // Close directly
                if !ids.is_empty() {
                    let idx = rng.gen_range(0..ids.len());
                    let id = ids[idx];
                    if let Some(owner) = books.position(&id).map(|p| p.owner) {
                        if books.with_position(&id, |p| engine.close_position_directly(&id, p, &owner)).is_ok() {
                            ids.swap_remove(idx);
                        }
                    }
                }
            },
            7 => { // Gate change
                let raw = rng.gen_range(0..5);
                let _ = engine.set_operation_state(raw, &OWNER);
                if rng.gen_bool(0.5) {
                    let _ = engine.set_operation_state(OperationState::Operational as u8, &OWNER);
                }
            },
            _ => {}
        }

        check_invariants(&books, &offers, &canceled, i);
        for o in &offers {
            canceled.insert(o.hash(), books.offering(&o.hash()).canceled_amount);
        }
        assert_eq!(books.positions.len(), ids.len(), "position count drift at step {}", i);
    }
}

#[test]
fn failed_calls_leave_positions_untouched() {
    let mut rng = XorShiftRng::from_seed([0x5au8; 16]);
    let engine = MarginEngine::new(OWNER);
    let offers = offerings();
    let o = offers[0];
    let trader = key(100);
    let id = position_id(&trader, 0);
    let mut record = OfferingRecord::zeroed();
    let mut position = Position::zeroed();
    engine
        .open_position(
            &mut record,
            &mut position,
            &OpenRequest { offering: o, trader, principal: 1_000, collateral: 0, nonce: 0 },
            1_000,
        )
        .unwrap();

    for i in 0..500 {
        let before = position;
        let caller = key(rng.gen_range(0..255));
        let res = if rng.gen_bool(0.5) {
            engine.margin_call(&id, &mut position, rng.gen_range(0..10_000), &caller, 2_000 + i, &ParityDelegate)
        } else {
            engine.cancel_margin_call(&id, &mut position, &caller, &ParityDelegate)
        };
        if res.is_err() {
            assert_eq!(bytemuck::bytes_of(&before), bytemuck::bytes_of(&position), "failed call mutated at step {}", i);
        }
    }
}
