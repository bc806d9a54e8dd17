//! Script machine.
//!
//! A small stack machine over byte-string operands. An input is valid when
//! its unlock script followed by the prevout's locking script leaves a truthy
//! element on top of the stack. The only signature opcode is `CHECK_SIG_PQ`,
//! which verifies a Dilithium signature over the transaction sighash.
//!
//! Operand elements are capped at 520 bytes, except that `OP_PUSH2` may carry
//! post-quantum keys and signatures up to the Dilithium signature size; those
//! artifacts are an order of magnitude larger than anything a classical
//! script pushes.

use qbit_core::{hash_tagged, sig, tags, Hash};
use thiserror::Error;

/// Opcode table.
pub mod opcodes {
    /// Push: 1-byte length, then data.
    pub const OP_PUSH: u8 = 0x01;
    /// Push: 2-byte little-endian length, then data. For PQ keys/signatures.
    pub const OP_PUSH2: u8 = 0x02;
    /// Duplicate the top element.
    pub const OP_DUP: u8 = 0x10;
    /// Replace the top element with its tagged hash.
    pub const OP_HASH: u8 = 0x11;
    /// Verify a post-quantum signature: pops key then signature, pushes a
    /// boolean.
    pub const OP_CHECKSIG: u8 = 0x12;
    /// Remove the top element.
    pub const OP_DROP: u8 = 0x20;
    /// Swap the top two elements.
    pub const OP_SWAP: u8 = 0x21;
    /// Pop two elements, push equality as a boolean.
    pub const OP_EQUAL: u8 = 0x30;
    /// Pop the top element; fail unless truthy.
    pub const OP_VERIFY: u8 = 0x31;
    /// Mark the output unspendable; execution always fails.
    pub const OP_RETURN: u8 = 0xFF;
}

/// Maximum size of an ordinary stack element.
pub const MAX_ELEMENT_BYTES: usize = 520;

/// Maximum size of a `OP_PUSH2` element (Dilithium signature).
pub const MAX_CRYPTO_ELEMENT_BYTES: usize = sig::SIGNATURE_BYTES;

/// Maximum opcodes executed per input.
pub const MAX_OPCODES: usize = 201;

/// Maximum stack depth.
pub const MAX_STACK: usize = 1_000;

/// Step budget per input; hashing and signature checks cost more than stack
/// shuffles.
pub const STEP_BUDGET: u64 = 10_000;

const HASH_STEP_COST: u64 = 8;
const CHECKSIG_STEP_COST: u64 = 64;

/// Script failures. All are consensus failures; none is retryable.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptError {
    #[error("invalid or truncated opcode {0:#04x}")]
    InvalidOpcode(u8),
    #[error("stack underflow")]
    StackUnderflow,
    #[error("stack overflow")]
    StackOverflow,
    #[error("script budget exceeded")]
    BudgetExceeded,
    #[error("invalid signature encoding")]
    InvalidSignatureEncoding,
    #[error("verification failed")]
    VerifyFailed,
}

/// One evaluation of an input script pair.
pub struct ScriptVm<'a> {
    sighash: &'a Hash,
    stack: Vec<Vec<u8>>,
    ops: usize,
    steps: u64,
}

impl<'a> ScriptVm<'a> {
    /// Create a VM bound to the sighash `CHECK_SIG_PQ` verifies against.
    pub fn new(sighash: &'a Hash) -> Self {
        Self {
            sighash,
            stack: Vec::new(),
            ops: 0,
            steps: 0,
        }
    }

    /// Evaluate `unlock` then `lock` over one shared stack. Succeeds when the
    /// final stack top is truthy.
    pub fn eval_input(
        unlock: &[u8],
        lock: &[u8],
        sighash: &Hash,
    ) -> Result<(), ScriptError> {
        let mut vm = ScriptVm::new(sighash);
        vm.run(unlock)?;
        vm.run(lock)?;
        match vm.stack.last() {
            Some(top) if is_truthy(top) => Ok(()),
            _ => Err(ScriptError::VerifyFailed),
        }
    }

    fn run(&mut self, script: &[u8]) -> Result<(), ScriptError> {
        let mut pc = 0usize;
        while pc < script.len() {
            let op = script[pc];
            pc += 1;

            self.ops += 1;
            if self.ops > MAX_OPCODES {
                return Err(ScriptError::BudgetExceeded);
            }
            self.charge(1)?;

            match op {
                opcodes::OP_PUSH => {
                    let len = *script.get(pc).ok_or(ScriptError::InvalidOpcode(op))? as usize;
                    pc += 1;
                    let data = script
                        .get(pc..pc + len)
                        .ok_or(ScriptError::InvalidOpcode(op))?;
                    pc += len;
                    self.charge(len as u64 / 32)?;
                    self.push(data.to_vec(), MAX_ELEMENT_BYTES)?;
                }
                opcodes::OP_PUSH2 => {
                    let hi = script.get(pc..pc + 2).ok_or(ScriptError::InvalidOpcode(op))?;
                    let len = u16::from_le_bytes([hi[0], hi[1]]) as usize;
                    pc += 2;
                    let data = script
                        .get(pc..pc + len)
                        .ok_or(ScriptError::InvalidOpcode(op))?;
                    pc += len;
                    self.charge(len as u64 / 32)?;
                    self.push(data.to_vec(), MAX_CRYPTO_ELEMENT_BYTES)?;
                }
                opcodes::OP_DUP => {
                    let top = self.peek()?.clone();
                    self.push_unchecked(top)?;
                }
                opcodes::OP_DROP => {
                    self.pop()?;
                }
                opcodes::OP_SWAP => {
                    let len = self.stack.len();
                    if len < 2 {
                        return Err(ScriptError::StackUnderflow);
                    }
                    self.stack.swap(len - 1, len - 2);
                }
                opcodes::OP_EQUAL => {
                    let a = self.pop()?;
                    let b = self.pop()?;
                    self.push_unchecked(bool_element(a == b))?;
                }
                opcodes::OP_VERIFY => {
                    let top = self.pop()?;
                    if !is_truthy(&top) {
                        return Err(ScriptError::VerifyFailed);
                    }
                }
                opcodes::OP_HASH => {
                    self.charge(HASH_STEP_COST)?;
                    let top = self.pop()?;
                    self.push_unchecked(hash_tagged(tags::KEY, &top).to_vec())?;
                }
                opcodes::OP_CHECKSIG => {
                    self.charge(CHECKSIG_STEP_COST)?;
                    let pubkey = self.pop()?;
                    let signature = self.pop()?;
                    if pubkey.len() != sig::PUBLIC_KEY_BYTES
                        || signature.len() != sig::SIGNATURE_BYTES
                    {
                        return Err(ScriptError::InvalidSignatureEncoding);
                    }
                    let ok = sig::verify(&pubkey, self.sighash.as_bytes(), &signature);
                    self.push_unchecked(bool_element(ok))?;
                }
                opcodes::OP_RETURN => return Err(ScriptError::VerifyFailed),
                other => return Err(ScriptError::InvalidOpcode(other)),
            }
        }
        Ok(())
    }

    fn charge(&mut self, cost: u64) -> Result<(), ScriptError> {
        self.steps += cost;
        if self.steps > STEP_BUDGET {
            Err(ScriptError::BudgetExceeded)
        } else {
            Ok(())
        }
    }

    fn push(&mut self, element: Vec<u8>, cap: usize) -> Result<(), ScriptError> {
        if element.len() > cap {
            return Err(ScriptError::StackOverflow);
        }
        self.push_unchecked(element)
    }

    fn push_unchecked(&mut self, element: Vec<u8>) -> Result<(), ScriptError> {
        if self.stack.len() >= MAX_STACK {
            return Err(ScriptError::StackOverflow);
        }
        self.stack.push(element);
        Ok(())
    }

    fn pop(&mut self) -> Result<Vec<u8>, ScriptError> {
        self.stack.pop().ok_or(ScriptError::StackUnderflow)
    }

    fn peek(&self) -> Result<&Vec<u8>, ScriptError> {
        self.stack.last().ok_or(ScriptError::StackUnderflow)
    }
}

fn bool_element(v: bool) -> Vec<u8> {
    if v {
        vec![1]
    } else {
        Vec::new()
    }
}

/// False when empty or all-zero, true otherwise.
fn is_truthy(element: &[u8]) -> bool {
    element.iter().any(|&b| b != 0)
}

/// Count signature operations in a script without executing it. Parsing
/// stops at the first malformed opcode; execution will reject such a script
/// anyway.
pub fn count_sigops(script: &[u8]) -> u32 {
    let mut count = 0u32;
    let mut pc = 0usize;
    while pc < script.len() {
        let op = script[pc];
        pc += 1;
        match op {
            opcodes::OP_PUSH => {
                let Some(&len) = script.get(pc) else { break };
                pc += 1 + len as usize;
            }
            opcodes::OP_PUSH2 => {
                let Some(hi) = script.get(pc..pc + 2) else { break };
                pc += 2 + u16::from_le_bytes([hi[0], hi[1]]) as usize;
            }
            opcodes::OP_CHECKSIG => count += 1,
            _ => {}
        }
    }
    count
}

// ---- script builders ----

/// Append a push of `data`, choosing the narrow or wide form.
pub fn push_element(out: &mut Vec<u8>, data: &[u8]) {
    if data.len() <= u8::MAX as usize {
        out.push(opcodes::OP_PUSH);
        out.push(data.len() as u8);
    } else {
        out.push(opcodes::OP_PUSH2);
        out.extend_from_slice(&(data.len() as u16).to_le_bytes());
    }
    out.extend_from_slice(data);
}

/// Locking script paying to a public key hash:
/// `DUP HASH <key-hash> EQUAL VERIFY CHECKSIG`.
pub fn pay_to_key_hash(key_hash: &Hash) -> Vec<u8> {
    let mut script = vec![opcodes::OP_DUP, opcodes::OP_HASH];
    push_element(&mut script, key_hash.as_bytes());
    script.push(opcodes::OP_EQUAL);
    script.push(opcodes::OP_VERIFY);
    script.push(opcodes::OP_CHECKSIG);
    script
}

/// Locking script paying directly to a public key: `<pubkey> CHECKSIG`.
pub fn pay_to_key(public_key: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(public_key.len() + 4);
    push_element(&mut script, public_key);
    script.push(opcodes::OP_CHECKSIG);
    script
}

/// Unlock script for [`pay_to_key`]: `<signature>`.
pub fn unlock_with_sig(signature: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(signature.len() + 3);
    push_element(&mut script, signature);
    script
}

/// Unlock script for [`pay_to_key_hash`]: `<signature> <pubkey>`.
pub fn unlock_with_sig_and_key(signature: &[u8], public_key: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(signature.len() + public_key.len() + 6);
    push_element(&mut script, signature);
    push_element(&mut script, public_key);
    script
}

/// Hash a public key for [`pay_to_key_hash`].
pub fn key_hash(public_key: &[u8]) -> Hash {
    hash_tagged(tags::KEY, public_key)
}

/// Provably unspendable output carrying arbitrary data.
pub fn unspendable(data: &[u8]) -> Vec<u8> {
    let mut script = vec![opcodes::OP_RETURN];
    script.extend_from_slice(data);
    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use qbit_core::sig::Keypair;

    fn sighash() -> Hash {
        hash_tagged(tags::SIGHASH, b"test tx digest")
    }

    #[test]
    fn test_pay_to_key_round_trip() {
        let kp = Keypair::generate(Some(b"script test key 1"));
        let digest = sighash();
        let lock = pay_to_key(&kp.public_bytes());
        let unlock = unlock_with_sig(&kp.sign(digest.as_bytes()));

        assert!(ScriptVm::eval_input(&unlock, &lock, &digest).is_ok());
    }

    #[test]
    fn test_pay_to_key_wrong_signature() {
        let kp = Keypair::generate(Some(b"script test key 2"));
        let other = hash_tagged(tags::SIGHASH, b"other digest");
        let lock = pay_to_key(&kp.public_bytes());
        let unlock = unlock_with_sig(&kp.sign(other.as_bytes()));

        assert_eq!(
            ScriptVm::eval_input(&unlock, &lock, &sighash()),
            Err(ScriptError::VerifyFailed)
        );
    }

    #[test]
    fn test_pay_to_key_hash_round_trip() {
        let kp = Keypair::generate(Some(b"script test key 3"));
        let digest = sighash();
        let pk = kp.public_bytes();
        let lock = pay_to_key_hash(&key_hash(&pk));
        let unlock = unlock_with_sig_and_key(&kp.sign(digest.as_bytes()), &pk);

        assert!(ScriptVm::eval_input(&unlock, &lock, &digest).is_ok());
    }

    #[test]
    fn test_pay_to_key_hash_wrong_key() {
        let kp = Keypair::generate(Some(b"script test key 4"));
        let imposter = Keypair::generate(Some(b"script test key 5"));
        let digest = sighash();
        let lock = pay_to_key_hash(&key_hash(&kp.public_bytes()));
        let unlock = unlock_with_sig_and_key(
            &imposter.sign(digest.as_bytes()),
            &imposter.public_bytes(),
        );

        // Fails at the key-hash VERIFY before any signature check.
        assert_eq!(
            ScriptVm::eval_input(&unlock, &lock, &digest),
            Err(ScriptError::VerifyFailed)
        );
    }

    #[test]
    fn test_malformed_signature_encoding() {
        let kp = Keypair::generate(Some(b"script test key 6"));
        let digest = sighash();
        let lock = pay_to_key(&kp.public_bytes());
        let unlock = unlock_with_sig(&[0xAB; 64]); // wrong size

        assert_eq!(
            ScriptVm::eval_input(&unlock, &lock, &digest),
            Err(ScriptError::InvalidSignatureEncoding)
        );
    }

    #[test]
    fn test_stack_ops() {
        // <1> DUP EQUAL  => true
        let mut script = Vec::new();
        push_element(&mut script, &[1]);
        script.push(opcodes::OP_DUP);
        script.push(opcodes::OP_EQUAL);
        assert!(ScriptVm::eval_input(&[], &script, &sighash()).is_ok());

        // <1> <2> SWAP DROP  => leaves <2>... after swap: [2,1]; drop -> [2]
        let mut script = Vec::new();
        push_element(&mut script, &[1]);
        push_element(&mut script, &[2]);
        script.push(opcodes::OP_SWAP);
        script.push(opcodes::OP_DROP);
        assert!(ScriptVm::eval_input(&[], &script, &sighash()).is_ok());
    }

    #[test]
    fn test_underflow_and_unknown_opcode() {
        assert_eq!(
            ScriptVm::eval_input(&[], &[opcodes::OP_DUP], &sighash()),
            Err(ScriptError::StackUnderflow)
        );
        assert_eq!(
            ScriptVm::eval_input(&[], &[0x99], &sighash()),
            Err(ScriptError::InvalidOpcode(0x99))
        );
    }

    #[test]
    fn test_truncated_push_rejected() {
        // OP_PUSH declaring 10 bytes with only 2 present.
        let script = vec![opcodes::OP_PUSH, 10, 0xAA, 0xBB];
        assert_eq!(
            ScriptVm::eval_input(&[], &script, &sighash()),
            Err(ScriptError::InvalidOpcode(opcodes::OP_PUSH))
        );
    }

    #[test]
    fn test_opcode_limit() {
        let mut script = Vec::new();
        push_element(&mut script, &[1]);
        for _ in 0..MAX_OPCODES {
            script.push(opcodes::OP_DUP);
            script.push(opcodes::OP_DROP);
        }
        assert_eq!(
            ScriptVm::eval_input(&[], &script, &sighash()),
            Err(ScriptError::BudgetExceeded)
        );
    }

    #[test]
    fn test_empty_final_stack_fails() {
        assert_eq!(
            ScriptVm::eval_input(&[], &[], &sighash()),
            Err(ScriptError::VerifyFailed)
        );
    }

    #[test]
    fn test_false_top_fails() {
        let mut script = Vec::new();
        push_element(&mut script, &[0, 0]); // all-zero is false
        assert_eq!(
            ScriptVm::eval_input(&[], &script, &sighash()),
            Err(ScriptError::VerifyFailed)
        );
    }

    #[test]
    fn test_unspendable_always_fails() {
        let kp = Keypair::generate(Some(b"script test key 7"));
        let digest = sighash();
        let lock = unspendable(b"data");
        let unlock = unlock_with_sig(&kp.sign(digest.as_bytes()));
        assert_eq!(
            ScriptVm::eval_input(&unlock, &lock, &digest),
            Err(ScriptError::VerifyFailed)
        );
    }

    #[test]
    fn test_count_sigops() {
        let kp = Keypair::generate(Some(b"script test key 8"));
        assert_eq!(count_sigops(&pay_to_key(&kp.public_bytes())), 1);
        assert_eq!(count_sigops(&pay_to_key_hash(&key_hash(b"k"))), 1);
        assert_eq!(count_sigops(&unspendable(b"x")), 0);

        // Pushed data containing the CHECKSIG byte is not counted.
        let mut script = Vec::new();
        push_element(&mut script, &[opcodes::OP_CHECKSIG; 4]);
        assert_eq!(count_sigops(&script), 0);
    }

    #[test]
    fn test_oversized_plain_push_rejected() {
        let mut script = vec![opcodes::OP_PUSH2];
        let len = (MAX_CRYPTO_ELEMENT_BYTES + 1) as u16;
        script.extend_from_slice(&len.to_le_bytes());
        script.extend(std::iter::repeat(0u8).take(len as usize));
        assert_eq!(
            ScriptVm::eval_input(&[], &script, &sighash()),
            Err(ScriptError::StackOverflow)
        );
    }
}
