//! Best-effort script to address extraction.

use dashcore::blockdata::script::Instruction;
use dashcore::{Address, Network, PublicKey, Script};

/// Resolve an output script to a payment address, if it is standard.
pub(crate) fn output_address(script: &Script, network: Network) -> Option<Address> {
    Address::from_script(script, network).ok()
}

/// Resolve a P2PKH-style input script to the spender's address.
///
/// The final push is taken as the spending public key; a script containing
/// opcodes, an undecodable push, or no valid key yields `None`.
pub(crate) fn input_address(script_sig: &Script, network: Network) -> Option<Address> {
    let mut last_push: Option<&[u8]> = None;
    for instruction in script_sig.instructions() {
        match instruction.ok()? {
            Instruction::PushBytes(bytes) => last_push = Some(bytes.as_bytes()),
            Instruction::Op(_) => return None,
        }
    }
    let pubkey = PublicKey::from_slice(last_push?).ok()?;
    Some(Address::p2pkh(&pubkey, network))
}
