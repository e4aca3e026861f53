//! Margin: single-file Solana program around the margin ledger engine.

#![no_std]
#![deny(unsafe_code)]

extern crate alloc;
// thiserror and `PrintProgramError` name `std::error::Error`.
extern crate std;

pub mod engine;

use solana_program::pubkey::Pubkey;

// 1. mod constants
pub mod constants {
    use core::mem::{align_of, size_of};
    use crate::engine::{MarginEngine, OfferingRecord, Position};
    use crate::state::{LedgerConfig, SlabHeader};

    pub const MAGIC: u64 = 0x4d415247494e4c47; // "MARGINLG"
    pub const VERSION: u32 = 1;

    pub const HEADER_LEN: usize = size_of::<SlabHeader>();
    pub const CONFIG_LEN: usize = size_of::<LedgerConfig>();
    pub const ENGINE_ALIGN: usize = align_of::<MarginEngine>();

    pub const fn align_up(x: usize, a: usize) -> usize {
        (x + (a - 1)) & !(a - 1)
    }

    pub const ENGINE_OFF: usize = align_up(HEADER_LEN + CONFIG_LEN, ENGINE_ALIGN);
    pub const ENGINE_LEN: usize = size_of::<MarginEngine>();
    pub const SLAB_LEN: usize = ENGINE_OFF + ENGINE_LEN;

    pub const VAULT_SEED: &[u8] = b"vault";
    /// `[OFFERING_SEED, slab, loan_hash]`
    pub const OFFERING_SEED: &[u8] = b"offering";
    /// `[POSITION_SEED, slab, position_id]`
    pub const POSITION_SEED: &[u8] = b"position";

    pub const OFFERING_RECORD_LEN: usize = size_of::<OfferingRecord>();
    pub const POSITION_LEN: usize = size_of::<Position>();

    pub const DELEGATE_ABI_VERSION: u32 = 1;
    /// tag(1) + caller(32) + position_id(32) + required_deposit(8)
    pub const DELEGATE_REQUEST_LEN: usize = 73;
    /// abi_version(4) + approved(1) + position_id(32)
    pub const DELEGATE_RETURN_LEN: usize = 37;

    /// payer(32) + owner_kind(1) + owner(32) + max_amount(8) + interest_rate(4)
    /// + interest_period(4) + expiration_timestamp(8) + salt(8)
    pub const OFFERING_WIRE_LEN: usize = 97;
}

// 2. mod zc
pub mod zc {
    use solana_program::program_error::ProgramError;
    use crate::constants::{ENGINE_LEN, ENGINE_OFF};
    use crate::engine::MarginEngine;

    #[inline]
    pub fn engine_ref(data: &[u8]) -> Result<&MarginEngine, ProgramError> {
        let bytes = data
            .get(ENGINE_OFF..ENGINE_OFF + ENGINE_LEN)
            .ok_or(ProgramError::InvalidAccountData)?;
        bytemuck::try_from_bytes(bytes).map_err(|_| ProgramError::InvalidAccountData)
    }

    #[inline]
    pub fn engine_mut(data: &mut [u8]) -> Result<&mut MarginEngine, ProgramError> {
        let bytes = data
            .get_mut(ENGINE_OFF..ENGINE_OFF + ENGINE_LEN)
            .ok_or(ProgramError::InvalidAccountData)?;
        bytemuck::try_from_bytes_mut(bytes).map_err(|_| ProgramError::InvalidAccountData)
    }
}

// 3. mod error
pub mod error {
    use alloc::format;
    use num_derive::FromPrimitive;
    use num_traits::FromPrimitive;
    use solana_program::{
        decode_error::DecodeError,
        msg,
        program_error::{PrintProgramError, ProgramError},
    };
    use thiserror::Error;
    use crate::engine::LedgerError;

    #[derive(Clone, Copy, Debug, Eq, PartialEq, Error, FromPrimitive)]
    pub enum MarginError {
        #[error("slab magic mismatch")]
        InvalidMagic,
        #[error("slab version mismatch")]
        InvalidVersion,
        #[error("slab already initialized")]
        AlreadyInitialized,
        #[error("slab not initialized")]
        NotInitialized,
        #[error("slab has the wrong length")]
        InvalidSlabLen,
        #[error("vault token account is invalid")]
        InvalidVaultAta,
        #[error("token account mint mismatch")]
        InvalidMint,
        #[error("account must sign")]
        ExpectedSigner,
        #[error("account must be writable")]
        ExpectedWritable,
        #[error("ledger record account has the wrong length")]
        InvalidRecordLen,
        // Ledger errors mapped:
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

    impl From<MarginError> for ProgramError {
        fn from(e: MarginError) -> Self {
            ProgramError::Custom(e as u32)
        }
    }

    impl<T> DecodeError<T> for MarginError {
        fn type_of() -> &'static str {
            "MarginError"
        }
    }

    impl PrintProgramError for MarginError {
        fn print<E>(&self)
        where
            E: 'static + std::error::Error + DecodeError<E> + PrintProgramError + FromPrimitive,
        {
            msg!("Error: {}", self);
        }
    }

    impl From<LedgerError> for MarginError {
        fn from(e: LedgerError) -> Self {
            match e {
                LedgerError::Unauthorized => MarginError::Unauthorized,
                LedgerError::OperationNotPermitted => MarginError::OperationNotPermitted,
                LedgerError::InvalidOperationState => MarginError::InvalidOperationState,
                LedgerError::LoanOfferingExpired => MarginError::LoanOfferingExpired,
                LedgerError::AlreadyCalled => MarginError::AlreadyCalled,
                LedgerError::NotCalled => MarginError::NotCalled,
                LedgerError::PositionNotFound => MarginError::PositionNotFound,
                LedgerError::PositionExists => MarginError::PositionExists,
                LedgerError::InsufficientLoanCapacity => MarginError::InsufficientLoanCapacity,
                LedgerError::ZeroAmount => MarginError::ZeroAmount,
                LedgerError::RecordMismatch => MarginError::RecordMismatch,
                LedgerError::InvalidTimestamp => MarginError::InvalidTimestamp,
                LedgerError::Overflow => MarginError::Overflow,
                LedgerError::InvalidLenderKind => MarginError::InvalidLenderKind,
                LedgerError::DelegateMismatch => MarginError::DelegateMismatch,
                LedgerError::DelegateCallFailed => MarginError::DelegateCallFailed,
                LedgerError::InvalidDelegateResponse => MarginError::InvalidDelegateResponse,
            }
        }
    }

    pub fn map_ledger_error(e: LedgerError) -> ProgramError {
        MarginError::from(e).into()
    }
}

// 4. mod ix
pub mod ix {
    use alloc::vec::Vec;
    use arrayref::array_ref;
    use solana_program::{program_error::ProgramError, pubkey::Pubkey};
    use crate::engine::{LenderRef, LoanOffering, PositionId};

    #[derive(Clone, Debug, PartialEq)]
    pub enum Instruction {
        InitMargin,
        SetOperationState { state: u8 },
        UpdateOwner { new_owner: Pubkey },
        CancelLoanOffering { offering: LoanOffering, amount: u64 },
        OpenPosition { offering: LoanOffering, principal: u64, collateral: u64, nonce: u64 },
        MarginCall { position_id: PositionId, required_deposit: u64 },
        CancelMarginCall { position_id: PositionId },
        DepositCollateral { position_id: PositionId, amount: u64 },
        ClosePositionDirectly { position_id: PositionId },
        TransferLoan { position_id: PositionId, new_lender: LenderRef },
        TransferPosition { position_id: PositionId, new_owner: Pubkey },
    }

    impl Instruction {
        pub fn decode(input: &[u8]) -> Result<Self, ProgramError> {
            let (&tag, mut rest) = input.split_first().ok_or(ProgramError::InvalidInstructionData)?;

            match tag {
                0 => Ok(Instruction::InitMargin),
                1 => {
                    let state = read_u8(&mut rest)?;
                    Ok(Instruction::SetOperationState { state })
                }
                2 => {
                    let new_owner = read_pubkey(&mut rest)?;
                    Ok(Instruction::UpdateOwner { new_owner })
                }
                3 => {
                    let offering = read_offering(&mut rest)?;
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::CancelLoanOffering { offering, amount })
                }
                4 => {
                    let offering = read_offering(&mut rest)?;
                    let principal = read_u64(&mut rest)?;
                    let collateral = read_u64(&mut rest)?;
                    let nonce = read_u64(&mut rest)?;
                    Ok(Instruction::OpenPosition { offering, principal, collateral, nonce })
                }
                5 => {
                    let position_id = read_bytes32(&mut rest)?;
                    let required_deposit = read_u64(&mut rest)?;
                    Ok(Instruction::MarginCall { position_id, required_deposit })
                }
                6 => {
                    let position_id = read_bytes32(&mut rest)?;
                    Ok(Instruction::CancelMarginCall { position_id })
                }
                7 => {
                    let position_id = read_bytes32(&mut rest)?;
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::DepositCollateral { position_id, amount })
                }
                8 => {
                    let position_id = read_bytes32(&mut rest)?;
                    Ok(Instruction::ClosePositionDirectly { position_id })
                }
                9 => {
                    let position_id = read_bytes32(&mut rest)?;
                    let new_lender = read_lender(&mut rest)?;
                    Ok(Instruction::TransferLoan { position_id, new_lender })
                }
                10 => {
                    let position_id = read_bytes32(&mut rest)?;
                    let new_owner = read_pubkey(&mut rest)?;
                    Ok(Instruction::TransferPosition { position_id, new_owner })
                }
                _ => Err(ProgramError::InvalidInstructionData),
            }
        }

        /// Client-side encoder; inverse of [`Instruction::decode`].
        pub fn pack(&self) -> Vec<u8> {
            let mut buf = Vec::with_capacity(128);
            match self {
                Instruction::InitMargin => buf.push(0),
                Instruction::SetOperationState { state } => {
                    buf.push(1);
                    buf.push(*state);
                }
                Instruction::UpdateOwner { new_owner } => {
                    buf.push(2);
                    buf.extend_from_slice(new_owner.as_ref());
                }
                Instruction::CancelLoanOffering { offering, amount } => {
                    buf.push(3);
                    write_offering(&mut buf, offering);
                    buf.extend_from_slice(&amount.to_le_bytes());
                }
                Instruction::OpenPosition { offering, principal, collateral, nonce } => {
                    buf.push(4);
                    write_offering(&mut buf, offering);
                    buf.extend_from_slice(&principal.to_le_bytes());
                    buf.extend_from_slice(&collateral.to_le_bytes());
                    buf.extend_from_slice(&nonce.to_le_bytes());
                }
                Instruction::MarginCall { position_id, required_deposit } => {
                    buf.push(5);
                    buf.extend_from_slice(position_id);
                    buf.extend_from_slice(&required_deposit.to_le_bytes());
                }
                Instruction::CancelMarginCall { position_id } => {
                    buf.push(6);
                    buf.extend_from_slice(position_id);
                }
                Instruction::DepositCollateral { position_id, amount } => {
                    buf.push(7);
                    buf.extend_from_slice(position_id);
                    buf.extend_from_slice(&amount.to_le_bytes());
                }
                Instruction::ClosePositionDirectly { position_id } => {
                    buf.push(8);
                    buf.extend_from_slice(position_id);
                }
                Instruction::TransferLoan { position_id, new_lender } => {
                    buf.push(9);
                    buf.extend_from_slice(position_id);
                    write_lender(&mut buf, new_lender);
                }
                Instruction::TransferPosition { position_id, new_owner } => {
                    buf.push(10);
                    buf.extend_from_slice(position_id);
                    buf.extend_from_slice(new_owner.as_ref());
                }
            }
            buf
        }
    }

    fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], ProgramError> {
        if input.len() < n {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(n);
        *input = rest;
        Ok(bytes)
    }

    fn read_u8(input: &mut &[u8]) -> Result<u8, ProgramError> {
        let (&val, rest) = input.split_first().ok_or(ProgramError::InvalidInstructionData)?;
        *input = rest;
        Ok(val)
    }

    fn read_u32(input: &mut &[u8]) -> Result<u32, ProgramError> {
        let bytes = take(input, 4)?;
        Ok(u32::from_le_bytes(*array_ref![bytes, 0, 4]))
    }

    fn read_u64(input: &mut &[u8]) -> Result<u64, ProgramError> {
        let bytes = take(input, 8)?;
        Ok(u64::from_le_bytes(*array_ref![bytes, 0, 8]))
    }

    fn read_bytes32(input: &mut &[u8]) -> Result<[u8; 32], ProgramError> {
        let bytes = take(input, 32)?;
        Ok(*array_ref![bytes, 0, 32])
    }

    fn read_pubkey(input: &mut &[u8]) -> Result<Pubkey, ProgramError> {
        Ok(Pubkey::new_from_array(read_bytes32(input)?))
    }

    fn read_lender(input: &mut &[u8]) -> Result<LenderRef, ProgramError> {
        let kind = read_u8(input)?;
        let key = read_bytes32(input)?;
        LenderRef::from_parts(kind, key).map_err(|_| ProgramError::InvalidInstructionData)
    }

    fn read_offering(input: &mut &[u8]) -> Result<LoanOffering, ProgramError> {
        Ok(LoanOffering {
            payer: read_bytes32(input)?,
            owner: read_lender(input)?,
            max_amount: read_u64(input)?,
            interest_rate: read_u32(input)?,
            interest_period: read_u32(input)?,
            expiration_timestamp: read_u64(input)?,
            salt: read_u64(input)?,
        })
    }

    fn write_lender(buf: &mut Vec<u8>, lender: &LenderRef) {
        buf.push(lender.kind() as u8);
        buf.extend_from_slice(lender.key());
    }

    fn write_offering(buf: &mut Vec<u8>, o: &LoanOffering) {
        buf.extend_from_slice(&o.payer);
        write_lender(buf, &o.owner);
        buf.extend_from_slice(&o.max_amount.to_le_bytes());
        buf.extend_from_slice(&o.interest_rate.to_le_bytes());
        buf.extend_from_slice(&o.interest_period.to_le_bytes());
        buf.extend_from_slice(&o.expiration_timestamp.to_le_bytes());
        buf.extend_from_slice(&o.salt.to_le_bytes());
    }
}

// 5. mod accounts
pub mod accounts {
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, pubkey::Pubkey};
    use crate::constants::{OFFERING_SEED, POSITION_SEED, VAULT_SEED};
    use crate::engine::{LoanHash, PositionId};
    use crate::error::MarginError;

    pub fn expect_len(accounts: &[AccountInfo], n: usize) -> Result<(), ProgramError> {
        if accounts.len() < n {
            return Err(ProgramError::NotEnoughAccountKeys);
        }
        Ok(())
    }

    pub fn expect_signer(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_signer {
            return Err(MarginError::ExpectedSigner.into());
        }
        Ok(())
    }

    pub fn expect_writable(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_writable {
            return Err(MarginError::ExpectedWritable.into());
        }
        Ok(())
    }

    pub fn expect_owner(ai: &AccountInfo, owner: &Pubkey) -> Result<(), ProgramError> {
        if ai.owner != owner {
            return Err(ProgramError::IllegalOwner);
        }
        Ok(())
    }

    pub fn expect_key(ai: &AccountInfo, expected: &Pubkey) -> Result<(), ProgramError> {
        if ai.key != expected {
            return Err(ProgramError::InvalidArgument);
        }
        Ok(())
    }

    pub fn derive_vault_authority(program_id: &Pubkey, slab_key: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[VAULT_SEED, slab_key.as_ref()], program_id)
    }

    pub fn derive_offering_record(program_id: &Pubkey, slab_key: &Pubkey, loan_hash: &LoanHash) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[OFFERING_SEED, slab_key.as_ref(), loan_hash], program_id)
    }

    pub fn derive_position_record(program_id: &Pubkey, slab_key: &Pubkey, position_id: &PositionId) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[POSITION_SEED, slab_key.as_ref(), position_id], program_id)
    }
}

// 6. mod state
pub mod state {
    use bytemuck::{Pod, Zeroable};
    use core::cell::RefMut;
    use core::mem::size_of;
    use solana_program::account_info::AccountInfo;
    use solana_program::program_error::ProgramError;
    use solana_program::pubkey::Pubkey;
    use crate::accounts;
    use crate::constants::{CONFIG_LEN, HEADER_LEN, MAGIC};
    use crate::engine::{LoanHash, OfferingRecord, OperationState, Position};
    use crate::error::MarginError;
    use crate::zc;

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct SlabHeader {
        pub magic: u64,
        pub version: u32,
        pub bump: u8,
        pub _padding: [u8; 3],
        pub _reserved: [u8; 48],
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct LedgerConfig {
        pub collateral_mint: [u8; 32],
        pub vault_pubkey: [u8; 32],
        pub vault_authority_bump: u8,
        pub _padding: [u8; 7],
    }

    pub fn slab_data_mut<'a, 'b>(ai: &'b AccountInfo<'a>) -> Result<RefMut<'b, &'a mut [u8]>, ProgramError> {
        Ok(ai.try_borrow_mut_data()?)
    }

    pub fn read_header(data: &[u8]) -> SlabHeader {
        bytemuck::pod_read_unaligned(&data[..HEADER_LEN])
    }

    pub fn write_header(data: &mut [u8], h: &SlabHeader) {
        data[..HEADER_LEN].copy_from_slice(bytemuck::bytes_of(h));
    }

    pub fn read_config(data: &[u8]) -> LedgerConfig {
        bytemuck::pod_read_unaligned(&data[HEADER_LEN..HEADER_LEN + CONFIG_LEN])
    }

    pub fn write_config(data: &mut [u8], c: &LedgerConfig) {
        data[HEADER_LEN..HEADER_LEN + CONFIG_LEN].copy_from_slice(bytemuck::bytes_of(c));
    }

    /// Copies a record out of its account. An account with no data has not
    /// been created yet and reads as a zeroed record.
    pub fn load_record<T: Pod>(program_id: &Pubkey, ai: &AccountInfo) -> Result<T, ProgramError> {
        if ai.data_is_empty() {
            return Ok(T::zeroed());
        }
        accounts::expect_owner(ai, program_id)?;
        let data = ai.try_borrow_data()?;
        if data.len() != size_of::<T>() {
            return Err(MarginError::InvalidRecordLen.into());
        }
        Ok(bytemuck::pod_read_unaligned(&data))
    }

    pub fn store_record<T: Pod>(ai: &AccountInfo, value: &T) -> Result<(), ProgramError> {
        let mut data = ai.try_borrow_mut_data()?;
        if data.len() != size_of::<T>() {
            return Err(MarginError::InvalidRecordLen.into());
        }
        data.copy_from_slice(bytemuck::bytes_of(value));
        Ok(())
    }

    /// Offering accounting as stored in a record account's data. Missing or
    /// foreign records read as empty.
    pub fn read_offering(data: &[u8], loan_hash: &LoanHash) -> OfferingRecord {
        if data.len() != size_of::<OfferingRecord>() {
            return OfferingRecord::empty(*loan_hash);
        }
        bytemuck::pod_read_unaligned::<OfferingRecord>(data).view(loan_hash)
    }

    pub fn read_position(data: &[u8]) -> Option<Position> {
        if data.len() != size_of::<Position>() {
            return None;
        }
        let p: Position = bytemuck::pod_read_unaligned(data);
        p.is_used().then_some(p)
    }

    /// Offset of the owner key inside a position account, for
    /// `getProgramAccounts` memcmp filters.
    pub fn position_owner_offset() -> usize {
        memoffset::offset_of!(Position, owner)
    }

    pub fn position_lender_offset() -> usize {
        memoffset::offset_of!(Position, lender)
    }

    /// Current gate state of an initialized slab, for off-chain readers.
    pub fn operation_state(data: &[u8]) -> Result<OperationState, ProgramError> {
        if data.len() < HEADER_LEN || read_header(data).magic != MAGIC {
            return Err(MarginError::NotInitialized.into());
        }
        Ok(zc::engine_ref(data)?.operation_state())
    }
}

// 7. mod records
/// Lifecycle of the per-key record accounts. Records are created on first
/// write at their PDA, funded by the signer that caused the write.
pub mod records {
    use solana_program::{
        account_info::AccountInfo,
        program::{invoke, invoke_signed},
        program_error::ProgramError,
        pubkey::Pubkey,
        rent::Rent,
        system_instruction,
    };
    use crate::accounts;

    /// Allocates `space` bytes owned by `program_id` at `record`, unless it
    /// already holds data. `signer_seeds` are the record's PDA seeds.
    #[allow(clippy::too_many_arguments)]
    pub fn ensure_created<'a>(
        program_id: &Pubkey,
        payer: &AccountInfo<'a>,
        record: &AccountInfo<'a>,
        system_program: &AccountInfo<'a>,
        rent: &Rent,
        space: usize,
        signer_seeds: &[&[u8]],
    ) -> Result<(), ProgramError> {
        if !record.data_is_empty() {
            return Ok(());
        }
        accounts::expect_writable(payer)?;
        let required = rent.minimum_balance(space);
        let current = record.lamports();

        if current == 0 {
            let ix = system_instruction::create_account(payer.key, record.key, required, space as u64, program_id);
            return invoke_signed(&ix, &[payer.clone(), record.clone(), system_program.clone()], &[signer_seeds]);
        }

        // Lamports already sit at the address, so create_account would fail.
        if current < required {
            let ix = system_instruction::transfer(payer.key, record.key, required - current);
            invoke(&ix, &[payer.clone(), record.clone(), system_program.clone()])?;
        }
        let ix = system_instruction::allocate(record.key, space as u64);
        invoke_signed(&ix, &[record.clone(), system_program.clone()], &[signer_seeds])?;
        let ix = system_instruction::assign(record.key, program_id);
        invoke_signed(&ix, &[record.clone(), system_program.clone()], &[signer_seeds])
    }

    /// Moves every lamport of `record` to `dest` and clears its data. The
    /// runtime reclaims the emptied account at the end of the transaction.
    pub fn close(record: &AccountInfo, dest: &AccountInfo) -> Result<(), ProgramError> {
        let total = dest
            .lamports()
            .checked_add(record.lamports())
            .ok_or(ProgramError::ArithmeticOverflow)?;
        **dest.try_borrow_mut_lamports()? = total;
        **record.try_borrow_mut_lamports()? = 0;
        record.try_borrow_mut_data()?.fill(0);
        Ok(())
    }
}

// 8. mod verify
/// Pure decision helpers shared by the engine, the processor and the
/// formal proofs in `tests/kani.rs`.
pub mod verify {
    /// Stored key must match the signer.
    #[inline]
    pub fn owner_ok(stored: [u8; 32], signer: [u8; 32]) -> bool {
        stored == signer
    }

    /// Gate owner must be non-zero (not burned) and match the signer.
    #[inline]
    pub fn admin_ok(admin: [u8; 32], signer: [u8; 32]) -> bool {
        admin != [0u8; 32] && admin == signer
    }

    /// Zero expiration never expires; otherwise live strictly before it.
    #[inline]
    pub fn offering_live(expiration_timestamp: u64, now: u64) -> bool {
        expiration_timestamp == 0 || now < expiration_timestamp
    }

    #[inline]
    pub fn remaining_capacity(max_amount: u64, canceled: u64, filled: u64) -> u64 {
        max_amount.saturating_sub(canceled.saturating_add(filled))
    }

    #[inline]
    pub fn cancel_amount(max_amount: u64, canceled: u64, filled: u64, requested: u64) -> u64 {
        requested.min(remaining_capacity(max_amount, canceled, filled))
    }

    #[inline]
    pub fn deposit_clears_call(call_timestamp: u64, required_deposit: u64, amount: u64) -> bool {
        call_timestamp != 0 && amount >= required_deposit
    }

    /// Negative unix time reads as zero, which margin calls reject.
    #[inline]
    pub fn clock_now(unix_timestamp: i64) -> u64 {
        unix_timestamp.max(0) as u64
    }

    /// The delegate program passed in must be the position's lender of record.
    #[inline]
    pub fn delegate_identity_ok(lender: [u8; 32], provided_program: [u8; 32]) -> bool {
        lender == provided_program
    }
}

// 9. mod delegate_abi
pub mod delegate_abi {
    use alloc::vec::Vec;
    use crate::constants::{DELEGATE_ABI_VERSION, DELEGATE_REQUEST_LEN, DELEGATE_RETURN_LEN};
    use crate::engine::{Key, LedgerError, PositionId};

    pub const TAG_APPROVE_INITIATE: u8 = 0;
    pub const TAG_APPROVE_CANCEL: u8 = 1;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DelegateReturn {
        pub abi_version: u32,
        pub approved: u8,
        pub position_id: PositionId,
    }

    pub fn encode_request(tag: u8, caller: &Key, position_id: &PositionId, required_deposit: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity(DELEGATE_REQUEST_LEN);
        data.push(tag);
        data.extend_from_slice(caller);
        data.extend_from_slice(position_id);
        data.extend_from_slice(&required_deposit.to_le_bytes());
        data
    }

    /// Delegate-side encoder for the return-data payload.
    pub fn encode_return(ret: &DelegateReturn) -> Vec<u8> {
        let mut data = Vec::with_capacity(DELEGATE_RETURN_LEN);
        data.extend_from_slice(&ret.abi_version.to_le_bytes());
        data.push(ret.approved);
        data.extend_from_slice(&ret.position_id);
        data
    }

    pub fn read_return(data: &[u8]) -> Result<DelegateReturn, LedgerError> {
        if data.len() != DELEGATE_RETURN_LEN {
            return Err(LedgerError::InvalidDelegateResponse);
        }
        let mut abi_version = [0u8; 4];
        abi_version.copy_from_slice(&data[0..4]);
        let mut position_id = [0u8; 32];
        position_id.copy_from_slice(&data[5..37]);
        Ok(DelegateReturn {
            abi_version: u32::from_le_bytes(abi_version),
            approved: data[4],
            position_id,
        })
    }

    /// Anything but a well-formed answer about this exact position is a
    /// failure, never an approval.
    pub fn validate_return(ret: &DelegateReturn, position_id: &PositionId) -> Result<bool, LedgerError> {
        if ret.abi_version != DELEGATE_ABI_VERSION {
            return Err(LedgerError::InvalidDelegateResponse);
        }
        if ret.approved > 1 {
            return Err(LedgerError::InvalidDelegateResponse);
        }
        if &ret.position_id != position_id {
            return Err(LedgerError::InvalidDelegateResponse);
        }
        Ok(ret.approved == 1)
    }
}

// 10. mod delegate
pub mod delegate {
    use alloc::format;
    use alloc::vec::Vec;
    use solana_program::{
        account_info::AccountInfo,
        instruction::{AccountMeta, Instruction as SolInstruction},
        msg,
        program::{get_return_data, invoke},
    };
    use crate::delegate_abi::{self, TAG_APPROVE_CANCEL, TAG_APPROVE_INITIATE};
    use crate::engine::{Key, LedgerError, MarginCallDelegate, PositionId};
    use crate::verify;

    /// Answers approval queries by invoking the delegate program passed at
    /// the tail of the instruction's account list. Accounts after the
    /// program are forwarded to it with their writability.
    pub struct CpiDelegate<'a, 'b> {
        caller: &'b AccountInfo<'a>,
        program: Option<&'b AccountInfo<'a>>,
        forwarded: &'b [AccountInfo<'a>],
    }

    impl<'a, 'b> CpiDelegate<'a, 'b> {
        pub fn new(caller: &'b AccountInfo<'a>, tail: &'b [AccountInfo<'a>]) -> Self {
            Self {
                caller,
                program: tail.first(),
                forwarded: tail.get(1..).unwrap_or(&[]),
            }
        }

        fn query(&self, delegate: &Key, position_id: &PositionId, request: Vec<u8>) -> Result<bool, LedgerError> {
            let program = self.program.ok_or(LedgerError::DelegateMismatch)?;
            if !verify::delegate_identity_ok(*delegate, program.key.to_bytes()) || !program.executable {
                return Err(LedgerError::DelegateMismatch);
            }

            // Signer privileges are not forwarded; the caller key travels in
            // the request data.
            let mut metas = Vec::with_capacity(1 + self.forwarded.len());
            metas.push(AccountMeta::new_readonly(*self.caller.key, false));
            for acc in self.forwarded {
                metas.push(if acc.is_writable {
                    AccountMeta::new(*acc.key, false)
                } else {
                    AccountMeta::new_readonly(*acc.key, false)
                });
            }

            let ix = SolInstruction {
                program_id: *program.key,
                accounts: metas,
                data: request,
            };

            let mut cpi_infos: Vec<AccountInfo> = Vec::with_capacity(2 + self.forwarded.len());
            cpi_infos.push(self.caller.clone());
            cpi_infos.extend(self.forwarded.iter().cloned());
            cpi_infos.push(program.clone());

            invoke(&ix, &cpi_infos).map_err(|e| {
                msg!("delegate {} failed: {:?}", program.key, e);
                LedgerError::DelegateCallFailed
            })?;

            let (returned_by, data) = get_return_data().ok_or(LedgerError::InvalidDelegateResponse)?;
            if returned_by != *program.key {
                return Err(LedgerError::InvalidDelegateResponse);
            }
            let ret = delegate_abi::read_return(&data)?;
            delegate_abi::validate_return(&ret, position_id)
        }
    }

    impl MarginCallDelegate for CpiDelegate<'_, '_> {
        fn approve_initiate(
            &self,
            delegate: &Key,
            caller: &Key,
            position_id: &PositionId,
            required_deposit: u64,
        ) -> Result<bool, LedgerError> {
            let request = delegate_abi::encode_request(TAG_APPROVE_INITIATE, caller, position_id, required_deposit);
            self.query(delegate, position_id, request)
        }

        fn approve_cancel(&self, delegate: &Key, caller: &Key, position_id: &PositionId) -> Result<bool, LedgerError> {
            let request = delegate_abi::encode_request(TAG_APPROVE_CANCEL, caller, position_id, 0);
            self.query(delegate, position_id, request)
        }
    }
}

// 11. mod events
pub mod events {
    use alloc::vec::Vec;
    use solana_program::{log::sol_log_data, msg};
    use crate::engine::{LenderRef, MarginEvent};

    pub fn tag(event: &MarginEvent) -> u8 {
        match event {
            MarginEvent::OperationStateChanged { .. } => 0,
            MarginEvent::OwnershipTransferred { .. } => 1,
            MarginEvent::LoanOfferingCanceled { .. } => 2,
            MarginEvent::PositionOpened { .. } => 3,
            MarginEvent::MarginCallInitiated { .. } => 4,
            MarginEvent::MarginCallCanceled { .. } => 5,
            MarginEvent::CollateralDeposited { .. } => 6,
            MarginEvent::PositionClosed { .. } => 7,
            MarginEvent::LoanTransferred { .. } => 8,
            MarginEvent::PositionTransferred { .. } => 9,
        }
    }

    fn put_lender(buf: &mut Vec<u8>, lender: &LenderRef) {
        buf.push(lender.kind() as u8);
        buf.extend_from_slice(lender.key());
    }

    /// Tag byte followed by the event fields, little-endian, in declaration order.
    pub fn encode(event: &MarginEvent) -> Vec<u8> {
        let mut buf = Vec::with_capacity(160);
        buf.push(tag(event));
        match event {
            MarginEvent::OperationStateChanged { from, to } => {
                buf.push(*from as u8);
                buf.push(*to as u8);
            }
            MarginEvent::OwnershipTransferred { previous, owner } => {
                buf.extend_from_slice(previous);
                buf.extend_from_slice(owner);
            }
            MarginEvent::LoanOfferingCanceled {
                loan_hash,
                payer,
                canceled_amount,
                total_canceled,
                unavailable_amount,
            } => {
                buf.extend_from_slice(loan_hash);
                buf.extend_from_slice(payer);
                buf.extend_from_slice(&canceled_amount.to_le_bytes());
                buf.extend_from_slice(&total_canceled.to_le_bytes());
                buf.extend_from_slice(&unavailable_amount.to_le_bytes());
            }
            MarginEvent::PositionOpened { position_id, trader, lender, loan_hash, principal, collateral } => {
                buf.extend_from_slice(position_id);
                buf.extend_from_slice(trader);
                put_lender(&mut buf, lender);
                buf.extend_from_slice(loan_hash);
                buf.extend_from_slice(&principal.to_le_bytes());
                buf.extend_from_slice(&collateral.to_le_bytes());
            }
            MarginEvent::MarginCallInitiated { position_id, lender, owner, required_deposit } => {
                buf.extend_from_slice(position_id);
                buf.extend_from_slice(lender);
                buf.extend_from_slice(owner);
                buf.extend_from_slice(&required_deposit.to_le_bytes());
            }
            MarginEvent::MarginCallCanceled { position_id, lender, owner, deposit_amount } => {
                buf.extend_from_slice(position_id);
                buf.extend_from_slice(lender);
                buf.extend_from_slice(owner);
                buf.extend_from_slice(&deposit_amount.to_le_bytes());
            }
            MarginEvent::CollateralDeposited { position_id, owner, amount, collateral } => {
                buf.extend_from_slice(position_id);
                buf.extend_from_slice(owner);
                buf.extend_from_slice(&amount.to_le_bytes());
                buf.extend_from_slice(&collateral.to_le_bytes());
            }
            MarginEvent::PositionClosed { position_id, owner, lender, principal, collateral } => {
                buf.extend_from_slice(position_id);
                buf.extend_from_slice(owner);
                buf.extend_from_slice(lender);
                buf.extend_from_slice(&principal.to_le_bytes());
                buf.extend_from_slice(&collateral.to_le_bytes());
            }
            MarginEvent::LoanTransferred { position_id, from, to } => {
                buf.extend_from_slice(position_id);
                buf.extend_from_slice(from);
                put_lender(&mut buf, to);
            }
            MarginEvent::PositionTransferred { position_id, from, to } => {
                buf.extend_from_slice(position_id);
                buf.extend_from_slice(from);
                buf.extend_from_slice(to);
            }
        }
        buf
    }

    pub fn emit(event: &MarginEvent) {
        msg!(event.name());
        let payload = encode(event);
        sol_log_data(&[payload.as_slice()]);
    }
}

// 12. mod collateral
pub mod collateral {
    use solana_program::{account_info::AccountInfo, program_error::ProgramError};

    #[cfg(not(test))]
    use solana_program::program::{invoke, invoke_signed};

    #[cfg(test)]
    use solana_program::program_pack::Pack;
    #[cfg(test)]
    use spl_token::state::Account as TokenAccount;

    #[cfg(test)]
    fn simulate_transfer(source: &AccountInfo, dest: &AccountInfo, amount: u64) -> Result<(), ProgramError> {
        let mut src_data = source.try_borrow_mut_data()?;
        let mut src_state = TokenAccount::unpack(&src_data)?;
        src_state.amount = src_state.amount.checked_sub(amount).ok_or(ProgramError::InsufficientFunds)?;
        TokenAccount::pack(src_state, &mut src_data)?;

        let mut dst_data = dest.try_borrow_mut_data()?;
        let mut dst_state = TokenAccount::unpack(&dst_data)?;
        dst_state.amount = dst_state.amount.checked_add(amount).ok_or(ProgramError::InvalidAccountData)?;
        TokenAccount::pack(dst_state, &mut dst_data)?;
        Ok(())
    }

    /// Moves tokens from a user account into the vault; `authority` signs.
    pub fn deposit<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::transfer(
                _token_program.key,
                source.key,
                dest.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke(&ix, &[source.clone(), dest.clone(), _authority.clone(), _token_program.clone()])
        }
        #[cfg(test)]
        {
            simulate_transfer(source, dest, amount)
        }
    }

    /// Moves tokens out of the vault; the vault PDA signs via `_signer_seeds`.
    pub fn withdraw<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
        _signer_seeds: &[&[&[u8]]],
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
        {
            let ix = spl_token::instruction::transfer(
                _token_program.key,
                source.key,
                dest.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke_signed(&ix, &[source.clone(), dest.clone(), _authority.clone(), _token_program.clone()], _signer_seeds)
        }
        #[cfg(test)]
        {
            simulate_transfer(source, dest, amount)
        }
    }
}

// 13. mod processor
pub mod processor {
    use alloc::format;
    use core::cell::{Ref, RefMut};
    use solana_program::{
        account_info::AccountInfo,
        entrypoint::ProgramResult,
        msg,
        program::set_return_data,
        program_error::ProgramError,
        program_pack::Pack,
        pubkey::Pubkey,
        rent::Rent,
        system_program,
        sysvar::{clock::Clock, Sysvar},
    };
    use crate::{
        accounts, collateral,
        constants::{MAGIC, OFFERING_RECORD_LEN, OFFERING_SEED, POSITION_LEN, POSITION_SEED, SLAB_LEN, VAULT_SEED, VERSION},
        delegate::CpiDelegate,
        engine::{position_id, LoanHash, MarginEngine, MarginEvent, OfferingRecord, OpenRequest, Position, PositionId},
        error::{map_ledger_error, MarginError},
        events,
        ix::Instruction,
        records,
        state::{self, LedgerConfig, SlabHeader},
        verify, zc,
    };

    fn slab_guard(program_id: &Pubkey, slab: &AccountInfo, data: &[u8]) -> Result<(), ProgramError> {
        accounts::expect_owner(slab, program_id)?;
        if data.len() != SLAB_LEN {
            return Err(MarginError::InvalidSlabLen.into());
        }
        Ok(())
    }

    fn require_initialized(data: &[u8]) -> Result<(), ProgramError> {
        let h = state::read_header(data);
        if h.magic != MAGIC {
            return Err(MarginError::NotInitialized.into());
        }
        if h.version != VERSION {
            return Err(MarginError::InvalidVersion.into());
        }
        Ok(())
    }

    fn open_slab<'a, 'b>(program_id: &Pubkey, a_slab: &'b AccountInfo<'a>) -> Result<RefMut<'b, &'a mut [u8]>, ProgramError> {
        accounts::expect_writable(a_slab)?;
        let data = state::slab_data_mut(a_slab)?;
        slab_guard(program_id, a_slab, &data)?;
        require_initialized(&data)?;
        Ok(data)
    }

    /// Read-only view of the slab for instructions that only consult the
    /// gate and the config.
    fn read_slab<'a, 'b>(program_id: &Pubkey, a_slab: &'b AccountInfo<'a>) -> Result<Ref<'b, &'b mut [u8]>, ProgramError> {
        let data = a_slab.try_borrow_data()?;
        slab_guard(program_id, a_slab, &data)?;
        require_initialized(&data)?;
        Ok(data)
    }

    fn load_engine(program_id: &Pubkey, a_slab: &AccountInfo) -> Result<(MarginEngine, LedgerConfig), ProgramError> {
        let data = read_slab(program_id, a_slab)?;
        Ok((*zc::engine_ref(&data)?, state::read_config(&data)))
    }

    /// Checks `a_record` is the writable offering PDA for `loan_hash` and
    /// returns its bump.
    fn offering_record_bump(program_id: &Pubkey, a_slab: &AccountInfo, a_record: &AccountInfo, loan_hash: &LoanHash) -> Result<u8, ProgramError> {
        accounts::expect_writable(a_record)?;
        let (expected, bump) = accounts::derive_offering_record(program_id, a_slab.key, loan_hash);
        accounts::expect_key(a_record, &expected)?;
        Ok(bump)
    }

    fn position_record_bump(program_id: &Pubkey, a_slab: &AccountInfo, a_record: &AccountInfo, id: &PositionId) -> Result<u8, ProgramError> {
        accounts::expect_writable(a_record)?;
        let (expected, bump) = accounts::derive_position_record(program_id, a_slab.key, id);
        accounts::expect_key(a_record, &expected)?;
        Ok(bump)
    }

    fn load_position(program_id: &Pubkey, a_slab: &AccountInfo, a_position: &AccountInfo, id: &PositionId) -> Result<Position, ProgramError> {
        position_record_bump(program_id, a_slab, a_position, id)?;
        state::load_record(program_id, a_position)
    }

    fn verify_vault(a_vault: &AccountInfo, expected_owner: &Pubkey, expected_mint: &Pubkey, expected_pubkey: &Pubkey) -> Result<(), ProgramError> {
        if a_vault.key != expected_pubkey { return Err(MarginError::InvalidVaultAta.into()); }
        if a_vault.owner != &spl_token::ID { return Err(MarginError::InvalidVaultAta.into()); }
        if a_vault.data_len() != spl_token::state::Account::LEN { return Err(MarginError::InvalidVaultAta.into()); }

        let data = a_vault.try_borrow_data()?;
        let tok = spl_token::state::Account::unpack(&data)?;
        if tok.mint != *expected_mint { return Err(MarginError::InvalidMint.into()); }
        if tok.owner != *expected_owner { return Err(MarginError::InvalidVaultAta.into()); }
        Ok(())
    }

    fn verify_config_vault(program_id: &Pubkey, a_slab: &AccountInfo, a_vault: &AccountInfo, config: &LedgerConfig) -> Result<Pubkey, ProgramError> {
        let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
        verify_vault(
            a_vault,
            &auth,
            &Pubkey::new_from_array(config.collateral_mint),
            &Pubkey::new_from_array(config.vault_pubkey),
        )?;
        Ok(auth)
    }

    fn clock_now(a_clock: &AccountInfo) -> Result<u64, ProgramError> {
        let clock = Clock::from_account_info(a_clock)?;
        Ok(verify::clock_now(clock.unix_timestamp))
    }

    fn emit_opt(event: Option<MarginEvent>) {
        if let Some(event) = event {
            events::emit(&event);
        }
    }

    pub fn process_instruction<'a, 'b>(
        program_id: &Pubkey,
        accounts: &'b [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        let instruction = Instruction::decode(instruction_data)?;

        match instruction {
            Instruction::InitMargin => {
                accounts::expect_len(accounts, 4)?;
                let a_owner = &accounts[0];
                let a_slab = &accounts[1];
                let a_mint = &accounts[2];
                let a_vault = &accounts[3];

                accounts::expect_signer(a_owner)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;

                let header = state::read_header(&data);
                if header.magic == MAGIC { return Err(MarginError::AlreadyInitialized.into()); }

                let (auth, bump) = accounts::derive_vault_authority(program_id, a_slab.key);
                verify_vault(a_vault, &auth, a_mint.key, a_vault.key)?;

                data.fill(0);
                zc::engine_mut(&mut data)?.init(a_owner.key.to_bytes());

                let config = LedgerConfig {
                    collateral_mint: a_mint.key.to_bytes(),
                    vault_pubkey: a_vault.key.to_bytes(),
                    vault_authority_bump: bump,
                    _padding: [0; 7],
                };
                state::write_config(&mut data, &config);

                let new_header = SlabHeader {
                    magic: MAGIC,
                    version: VERSION,
                    bump,
                    _padding: [0; 3],
                    _reserved: [0; 48],
                };
                state::write_header(&mut data, &new_header);
                msg!("InitMargin: owner {}", a_owner.key);
            }
            Instruction::SetOperationState { state } => {
                accounts::expect_len(accounts, 2)?;
                let a_owner = &accounts[0];
                let a_slab = &accounts[1];
                accounts::expect_signer(a_owner)?;

                let mut data = open_slab(program_id, a_slab)?;
                let engine = zc::engine_mut(&mut data)?;
                let event = engine
                    .set_operation_state(state, &a_owner.key.to_bytes())
                    .map_err(map_ledger_error)?;
                emit_opt(event);
            }
            Instruction::UpdateOwner { new_owner } => {
                accounts::expect_len(accounts, 2)?;
                let a_owner = &accounts[0];
                let a_slab = &accounts[1];
                accounts::expect_signer(a_owner)?;

                let mut data = open_slab(program_id, a_slab)?;
                let engine = zc::engine_mut(&mut data)?;
                let event = engine
                    .transfer_ownership(new_owner.to_bytes(), &a_owner.key.to_bytes())
                    .map_err(map_ledger_error)?;
                emit_opt(event);
            }
            Instruction::CancelLoanOffering { offering, amount } => {
                accounts::expect_len(accounts, 6)?;
                let a_payer = &accounts[0];
                let a_slab = &accounts[1];
                let a_clock = &accounts[2];
                let a_rent = &accounts[3];
                let a_record = &accounts[4];
                let a_system = &accounts[5];
                accounts::expect_signer(a_payer)?;
                accounts::expect_key(a_system, &system_program::ID)?;

                let now = clock_now(a_clock)?;
                let rent = Rent::from_account_info(a_rent)?;
                let (engine, _) = load_engine(program_id, a_slab)?;

                let loan_hash = offering.hash();
                let bump = offering_record_bump(program_id, a_slab, a_record, &loan_hash)?;
                let mut record: OfferingRecord = state::load_record(program_id, a_record)?;
                let res = engine
                    .cancel_loan_offering(&mut record, &offering, amount, &a_payer.key.to_bytes(), now)
                    .map_err(map_ledger_error)?;

                if res.canceled > 0 {
                    let bump_arr: [u8; 1] = [bump];
                    let seeds: [&[u8]; 4] = [OFFERING_SEED, a_slab.key.as_ref(), &loan_hash, &bump_arr];
                    records::ensure_created(program_id, a_payer, a_record, a_system, &rent, OFFERING_RECORD_LEN, &seeds)?;
                    state::store_record(a_record, &record)?;
                }
                emit_opt(res.event);
                set_return_data(&res.canceled.to_le_bytes());
            }
            Instruction::OpenPosition { offering, principal, collateral, nonce } => {
                accounts::expect_len(accounts, 11)?;
                let a_trader = &accounts[0];
                let a_payer = &accounts[1];
                let a_slab = &accounts[2];
                let a_clock = &accounts[3];
                let a_rent = &accounts[4];
                let a_trader_ata = &accounts[5];
                let a_vault = &accounts[6];
                let a_token = &accounts[7];
                let a_record = &accounts[8];
                let a_position = &accounts[9];
                let a_system = &accounts[10];

                accounts::expect_signer(a_trader)?;
                accounts::expect_signer(a_payer)?;
                accounts::expect_key(a_token, &spl_token::ID)?;
                accounts::expect_key(a_system, &system_program::ID)?;
                if !verify::owner_ok(offering.payer, a_payer.key.to_bytes()) {
                    return Err(MarginError::Unauthorized.into());
                }

                let now = clock_now(a_clock)?;
                let rent = Rent::from_account_info(a_rent)?;
                let (engine, config) = load_engine(program_id, a_slab)?;
                verify_config_vault(program_id, a_slab, a_vault, &config)?;

                let loan_hash = offering.hash();
                let id = position_id(&a_trader.key.to_bytes(), nonce);
                let record_bump = offering_record_bump(program_id, a_slab, a_record, &loan_hash)?;
                let position_bump = position_record_bump(program_id, a_slab, a_position, &id)?;
                let mut record: OfferingRecord = state::load_record(program_id, a_record)?;
                let mut slot: Position = state::load_record(program_id, a_position)?;

                let req = OpenRequest {
                    offering,
                    trader: a_trader.key.to_bytes(),
                    principal,
                    collateral,
                    nonce,
                };
                let event = engine
                    .open_position(&mut record, &mut slot, &req, now)
                    .map_err(map_ledger_error)?;

                // The trader funds both records.
                let record_bump_arr: [u8; 1] = [record_bump];
                let record_seeds: [&[u8]; 4] = [OFFERING_SEED, a_slab.key.as_ref(), &loan_hash, &record_bump_arr];
                records::ensure_created(program_id, a_trader, a_record, a_system, &rent, OFFERING_RECORD_LEN, &record_seeds)?;
                state::store_record(a_record, &record)?;

                let position_bump_arr: [u8; 1] = [position_bump];
                let position_seeds: [&[u8]; 4] = [POSITION_SEED, a_slab.key.as_ref(), &id, &position_bump_arr];
                records::ensure_created(program_id, a_trader, a_position, a_system, &rent, POSITION_LEN, &position_seeds)?;
                state::store_record(a_position, &slot)?;

                if collateral > 0 {
                    collateral::deposit(a_token, a_trader_ata, a_vault, a_trader, collateral)?;
                }
                events::emit(&event);
            }
            Instruction::MarginCall { position_id, required_deposit } => {
                accounts::expect_len(accounts, 4)?;
                let a_caller = &accounts[0];
                let a_slab = &accounts[1];
                let a_clock = &accounts[2];
                let a_position = &accounts[3];
                accounts::expect_signer(a_caller)?;

                let now = clock_now(a_clock)?;
                let (engine, _) = load_engine(program_id, a_slab)?;
                let mut position = load_position(program_id, a_slab, a_position, &position_id)?;
                let delegates = CpiDelegate::new(a_caller, &accounts[4..]);
                let event = engine
                    .margin_call(&position_id, &mut position, required_deposit, &a_caller.key.to_bytes(), now, &delegates)
                    .map_err(map_ledger_error)?;
                state::store_record(a_position, &position)?;
                events::emit(&event);
            }
            Instruction::CancelMarginCall { position_id } => {
                accounts::expect_len(accounts, 3)?;
                let a_caller = &accounts[0];
                let a_slab = &accounts[1];
                let a_position = &accounts[2];
                accounts::expect_signer(a_caller)?;

                let (engine, _) = load_engine(program_id, a_slab)?;
                let mut position = load_position(program_id, a_slab, a_position, &position_id)?;
                let delegates = CpiDelegate::new(a_caller, &accounts[3..]);
                let event = engine
                    .cancel_margin_call(&position_id, &mut position, &a_caller.key.to_bytes(), &delegates)
                    .map_err(map_ledger_error)?;
                state::store_record(a_position, &position)?;
                events::emit(&event);
            }
            Instruction::DepositCollateral { position_id, amount } => {
                accounts::expect_len(accounts, 6)?;
                let a_owner = &accounts[0];
                let a_slab = &accounts[1];
                let a_position = &accounts[2];
                let a_owner_ata = &accounts[3];
                let a_vault = &accounts[4];
                let a_token = &accounts[5];

                accounts::expect_signer(a_owner)?;
                accounts::expect_key(a_token, &spl_token::ID)?;

                let (engine, config) = load_engine(program_id, a_slab)?;
                verify_config_vault(program_id, a_slab, a_vault, &config)?;

                let mut position = load_position(program_id, a_slab, a_position, &position_id)?;
                let deposit = engine
                    .deposit_collateral(&position_id, &mut position, amount, &a_owner.key.to_bytes())
                    .map_err(map_ledger_error)?;
                state::store_record(a_position, &position)?;

                collateral::deposit(a_token, a_owner_ata, a_vault, a_owner, amount)?;
                events::emit(&deposit.event);
                emit_opt(deposit.call_canceled);
            }
            Instruction::ClosePositionDirectly { position_id } => {
                accounts::expect_len(accounts, 7)?;
                let a_owner = &accounts[0];
                let a_slab = &accounts[1];
                let a_position = &accounts[2];
                let a_vault = &accounts[3];
                let a_owner_ata = &accounts[4];
                let a_vault_pda = &accounts[5];
                let a_token = &accounts[6];

                accounts::expect_signer(a_owner)?;
                accounts::expect_writable(a_owner)?;
                accounts::expect_key(a_token, &spl_token::ID)?;

                let (engine, config) = load_engine(program_id, a_slab)?;
                let auth = verify_config_vault(program_id, a_slab, a_vault, &config)?;
                accounts::expect_key(a_vault_pda, &auth)?;

                let mut position = load_position(program_id, a_slab, a_position, &position_id)?;
                let closed = engine
                    .close_position_directly(&position_id, &mut position, &a_owner.key.to_bytes())
                    .map_err(map_ledger_error)?;

                if closed.position.collateral > 0 {
                    let bump_arr: [u8; 1] = [config.vault_authority_bump];
                    let seeds: [&[u8]; 3] = [VAULT_SEED, a_slab.key.as_ref(), &bump_arr];
                    let signer_seeds: [&[&[u8]]; 1] = [&seeds];
                    collateral::withdraw(
                        a_token,
                        a_vault,
                        a_owner_ata,
                        a_vault_pda,
                        closed.position.collateral,
                        &signer_seeds,
                    )?;
                }
                // Rent goes to whoever owns the position at close.
                records::close(a_position, a_owner)?;
                events::emit(&closed.event);
            }
            Instruction::TransferLoan { position_id, new_lender } => {
                accounts::expect_len(accounts, 3)?;
                let a_lender = &accounts[0];
                let a_slab = &accounts[1];
                let a_position = &accounts[2];
                accounts::expect_signer(a_lender)?;

                let (engine, _) = load_engine(program_id, a_slab)?;
                let mut position = load_position(program_id, a_slab, a_position, &position_id)?;
                let event = engine
                    .transfer_loan(&position_id, &mut position, new_lender, &a_lender.key.to_bytes())
                    .map_err(map_ledger_error)?;
                if event.is_some() {
                    state::store_record(a_position, &position)?;
                }
                emit_opt(event);
            }
            Instruction::TransferPosition { position_id, new_owner } => {
                accounts::expect_len(accounts, 3)?;
                let a_owner = &accounts[0];
                let a_slab = &accounts[1];
                let a_position = &accounts[2];
                accounts::expect_signer(a_owner)?;

                let (engine, _) = load_engine(program_id, a_slab)?;
                let mut position = load_position(program_id, a_slab, a_position, &position_id)?;
                let event = engine
                    .transfer_position(&position_id, &mut position, new_owner.to_bytes(), &a_owner.key.to_bytes())
                    .map_err(map_ledger_error)?;
                if event.is_some() {
                    state::store_record(a_position, &position)?;
                }
                emit_opt(event);
            }
        }
        Ok(())
    }
}

// 14. mod entrypoint
#[cfg(not(feature = "no-entrypoint"))]
pub mod entrypoint {
    #[allow(unused_imports)]
    use alloc::format;
    use solana_program::{
        account_info::AccountInfo, entrypoint, entrypoint::ProgramResult,
        program_error::PrintProgramError, pubkey::Pubkey,
    };
    use crate::{error::MarginError, processor};

    entrypoint!(process_instruction);

    fn process_instruction<'a>(
        program_id: &Pubkey,
        accounts: &'a [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        if let Err(error) = processor::process_instruction(program_id, accounts, instruction_data) {
            error.print::<MarginError>();
            return Err(error);
        }
        Ok(())
    }
}

/// Vault authority PDA for a slab, for clients assembling account lists.
pub fn vault_authority(program_id: &Pubkey, slab: &Pubkey) -> Pubkey {
    accounts::derive_vault_authority(program_id, slab).0
}

/// Address of the accounting record for one loan offering.
pub fn offering_record_address(program_id: &Pubkey, slab: &Pubkey, loan_hash: &engine::LoanHash) -> Pubkey {
    accounts::derive_offering_record(program_id, slab, loan_hash).0
}

pub fn position_address(program_id: &Pubkey, slab: &Pubkey, position_id: &engine::PositionId) -> Pubkey {
    accounts::derive_position_record(program_id, slab, position_id).0
}
