//! Transaction structures as consumed and produced by the VM, plus the
//! unsigned-transaction builder that balances inputs against outputs, fee,
//! and change.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Result};
use bytes::Bytes;
use ethereum_types::{H256, U256};

use crate::common::codec::{self, CodecError, Reader};
use crate::common::constants::{
    minimal_alf_amount_per_tx_output, DEFAULT_TX_VERSION, MAX_TOKEN_PER_UTXO, MAX_TX_INPUT_NUM,
};
use crate::common::crypto::blake2b256;
use crate::lockup::{LockupScript, TokenId};
use crate::vm::script::StatefulScript;

/// Reference to the asset output an input spends: the owner's script hint
/// plus the output's unique key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AssetOutputRef {
    pub hint: u32,
    pub key: H256,
}

impl AssetOutputRef {
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        codec::encode_u32(self.hint, buf);
        codec::encode_h256(&self.key, buf);
    }

    pub fn decode_from(r: &mut Reader) -> Result<Self, CodecError> {
        Ok(Self {
            hint: codec::decode_u32(r)?,
            key: codec::decode_h256(r)?,
        })
    }

    pub fn serialization(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(36);
        self.encode_to(&mut buf);
        buf
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub output_ref: AssetOutputRef,
    /// Opaque unlock payload (public key, multisig keys, or a serialized
    /// stateless script); validated by spend checking, not by the VM.
    pub unlock_script: Bytes,
}

impl TxInput {
    fn encode_to(&self, buf: &mut Vec<u8>) {
        self.output_ref.encode_to(buf);
        codec::encode_bytes(&self.unlock_script, buf);
    }

    fn decode_from(r: &mut Reader) -> Result<Self, CodecError> {
        Ok(Self {
            output_ref: AssetOutputRef::decode_from(r)?,
            unlock_script: codec::decode_bytes(r)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetOutput {
    pub amount: U256,
    pub lockup: LockupScript,
    /// Millisecond timestamp before which the output cannot be spent.
    pub lock_time: u64,
    pub tokens: Vec<(TokenId, U256)>,
    pub additional_data: Bytes,
}

impl AssetOutput {
    pub fn plain(amount: U256, lockup: LockupScript) -> Self {
        Self {
            amount,
            lockup,
            lock_time: 0,
            tokens: vec![],
            additional_data: Bytes::new(),
        }
    }

    fn encode_to(&self, buf: &mut Vec<u8>) {
        codec::encode_u256(&self.amount, buf);
        self.lockup.encode_to(buf);
        codec::encode_varint(self.lock_time, buf);
        codec::encode_len(self.tokens.len(), buf);
        for (token_id, amount) in &self.tokens {
            codec::encode_h256(token_id, buf);
            codec::encode_u256(amount, buf);
        }
        codec::encode_bytes(&self.additional_data, buf);
    }

    fn decode_from(r: &mut Reader) -> Result<Self, CodecError> {
        let amount = codec::decode_u256(r)?;
        let lockup = LockupScript::decode_from(r)?;
        let lock_time = codec::decode_varint(r)?;
        let n = codec::decode_len(r)?;
        let mut tokens = Vec::with_capacity(n);
        for _ in 0..n {
            tokens.push((codec::decode_h256(r)?, codec::decode_u256(r)?));
        }
        let additional_data = codec::decode_bytes(r)?;
        Ok(Self {
            amount,
            lockup,
            lock_time,
            tokens,
            additional_data,
        })
    }
}

/// Output guarded by a P2C lockup, produced only by contract execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractOutput {
    pub amount: U256,
    pub lockup: LockupScript,
    pub tokens: Vec<(TokenId, U256)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutput {
    Asset(AssetOutput),
    Contract(ContractOutput),
}

impl TxOutput {
    pub fn amount(&self) -> U256 {
        match self {
            TxOutput::Asset(output) => output.amount,
            TxOutput::Contract(output) => output.amount,
        }
    }

    pub fn tokens(&self) -> &[(TokenId, U256)] {
        match self {
            TxOutput::Asset(output) => &output.tokens,
            TxOutput::Contract(output) => &output.tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    pub version: u8,
    pub network_id: u8,
    pub script: Option<StatefulScript>,
    pub gas_amount: u64,
    pub gas_price: U256,
    pub inputs: Vec<TxInput>,
    pub fixed_outputs: Vec<AssetOutput>,
}

impl UnsignedTransaction {
    pub fn serialization(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = vec![];
        buf.push(self.version);
        buf.push(self.network_id);
        match &self.script {
            Some(script) => {
                buf.push(1);
                let code = script.serialization()?;
                codec::encode_bytes(&code, &mut buf);
            }
            None => buf.push(0),
        }
        codec::encode_varint(self.gas_amount, &mut buf);
        codec::encode_u256(&self.gas_price, &mut buf);
        codec::encode_len(self.inputs.len(), &mut buf);
        for input in &self.inputs {
            input.encode_to(&mut buf);
        }
        codec::encode_len(self.fixed_outputs.len(), &mut buf);
        for output in &self.fixed_outputs {
            output.encode_to(&mut buf);
        }
        Ok(buf)
    }

    pub fn deserialization(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let version = r.read_byte()?;
        let network_id = r.read_byte()?;
        let script = match r.read_byte()? {
            0 => None,
            1 => {
                let code = codec::decode_bytes(&mut r)?;
                Some(StatefulScript::deserialization(&code)?)
            }
            tag => return Err(CodecError::InvalidTag(tag)),
        };
        let gas_amount = codec::decode_varint(&mut r)?;
        let gas_price = codec::decode_u256(&mut r)?;
        let n = codec::decode_len(&mut r)?;
        let mut inputs = Vec::with_capacity(n);
        for _ in 0..n {
            inputs.push(TxInput::decode_from(&mut r)?);
        }
        let n = codec::decode_len(&mut r)?;
        let mut fixed_outputs = Vec::with_capacity(n);
        for _ in 0..n {
            fixed_outputs.push(AssetOutput::decode_from(&mut r)?);
        }
        r.finish()?;
        Ok(Self {
            version,
            network_id,
            script,
            gas_amount,
            gas_price,
            inputs,
            fixed_outputs,
        })
    }

    /// Transaction id: the protocol hash of the canonical serialization.
    pub fn id(&self) -> Result<H256, CodecError> {
        Ok(blake2b256(&self.serialization()?))
    }

    pub fn gas_fee(&self) -> Option<U256> {
        self.gas_price.checked_mul(U256::from(self.gas_amount))
    }
}

/// Builds a balanced unsigned transaction: validates shape limits, rejects
/// tokens that appear from nowhere, and routes the surplus to a change
/// output.
pub struct TxBuilder {
    network_id: u8,
    script: Option<StatefulScript>,
    gas_amount: u64,
    gas_price: U256,
    inputs: Vec<(TxInput, AssetOutput)>,
    outputs: Vec<AssetOutput>,
    change_lockup: LockupScript,
}

impl TxBuilder {
    pub fn new(network_id: u8, gas_amount: u64, gas_price: U256, change_lockup: LockupScript) -> Self {
        Self {
            network_id,
            script: None,
            gas_amount,
            gas_price,
            inputs: vec![],
            outputs: vec![],
            change_lockup,
        }
    }

    pub fn with_script(mut self, script: StatefulScript) -> Self {
        self.script = Some(script);
        self
    }

    /// An input together with the output it spends, which carries the funds.
    pub fn add_input(mut self, input: TxInput, spent_output: AssetOutput) -> Self {
        self.inputs.push((input, spent_output));
        self
    }

    pub fn add_output(mut self, output: AssetOutput) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn build(self) -> Result<UnsignedTransaction> {
        if self.inputs.is_empty() {
            bail!("a transaction needs at least one input");
        }
        if self.inputs.len() > MAX_TX_INPUT_NUM {
            bail!("too many inputs: {} > {}", self.inputs.len(), MAX_TX_INPUT_NUM);
        }
        let mut seen = BTreeSet::new();
        for (input, _) in &self.inputs {
            if !seen.insert(input.output_ref) {
                bail!("duplicate input {:?}", input.output_ref);
            }
        }
        if !self.change_lockup.is_asset() {
            bail!("change must go to an asset lockup");
        }
        for output in &self.outputs {
            check_output_shape(output)?;
        }

        // total up what the inputs provide
        let mut input_alf = U256::zero();
        let mut input_tokens: BTreeMap<TokenId, U256> = BTreeMap::new();
        for (_, spent) in &self.inputs {
            input_alf = input_alf
                .checked_add(spent.amount)
                .ok_or_else(|| anyhow::anyhow!("input ALPH overflow"))?;
            for (token_id, amount) in &spent.tokens {
                let entry = input_tokens.entry(*token_id).or_insert_with(U256::zero);
                *entry = entry
                    .checked_add(*amount)
                    .ok_or_else(|| anyhow::anyhow!("input token overflow"))?;
            }
        }

        // outputs may not spend more than the inputs provide, and may not
        // mention a token the inputs never carried
        let mut output_alf = U256::zero();
        let mut output_tokens: BTreeMap<TokenId, U256> = BTreeMap::new();
        for output in &self.outputs {
            output_alf = output_alf
                .checked_add(output.amount)
                .ok_or_else(|| anyhow::anyhow!("output ALPH overflow"))?;
            for (token_id, amount) in &output.tokens {
                let entry = output_tokens.entry(*token_id).or_insert_with(U256::zero);
                *entry = entry
                    .checked_add(*amount)
                    .ok_or_else(|| anyhow::anyhow!("output token overflow"))?;
            }
        }
        for (token_id, out_amount) in &output_tokens {
            match input_tokens.get(token_id) {
                None => bail!("output token {:?} not present in any input", token_id),
                Some(in_amount) if out_amount > in_amount => {
                    bail!("token {:?} outputs exceed inputs", token_id)
                }
                Some(_) => {}
            }
        }

        let gas_fee = self
            .gas_price
            .checked_mul(U256::from(self.gas_amount))
            .ok_or_else(|| anyhow::anyhow!("gas fee overflow"))?;
        let spent = output_alf
            .checked_add(gas_fee)
            .ok_or_else(|| anyhow::anyhow!("output ALPH overflow"))?;
        let change_alf = input_alf
            .checked_sub(spent)
            .ok_or_else(|| anyhow::anyhow!("inputs cannot cover outputs plus gas fee"))?;

        let change_tokens: Vec<(TokenId, U256)> = input_tokens
            .iter()
            .filter_map(|(token_id, in_amount)| {
                let leftover = *in_amount - output_tokens.get(token_id).copied().unwrap_or_default();
                (!leftover.is_zero()).then(|| (*token_id, leftover))
            })
            .collect();

        let mut fixed_outputs = self.outputs;
        if !change_alf.is_zero() || !change_tokens.is_empty() {
            let change = AssetOutput {
                amount: change_alf,
                lockup: self.change_lockup,
                lock_time: 0,
                tokens: change_tokens,
                additional_data: Bytes::new(),
            };
            check_output_shape(&change)
                .map_err(|e| anyhow::anyhow!("change output invalid: {}", e))?;
            fixed_outputs.push(change);
        }

        Ok(UnsignedTransaction {
            version: DEFAULT_TX_VERSION,
            network_id: self.network_id,
            script: self.script,
            gas_amount: self.gas_amount,
            gas_price: self.gas_price,
            inputs: self.inputs.into_iter().map(|(input, _)| input).collect(),
            fixed_outputs,
        })
    }
}

fn check_output_shape(output: &AssetOutput) -> Result<()> {
    if !output.lockup.is_asset() {
        bail!("fixed outputs must use an asset lockup");
    }
    if output.tokens.len() > MAX_TOKEN_PER_UTXO {
        bail!("too many tokens in one output: {}", output.tokens.len());
    }
    let mut seen = BTreeSet::new();
    for (token_id, amount) in &output.tokens {
        if amount.is_zero() {
            bail!("zero token amount for {:?}", token_id);
        }
        if !seen.insert(*token_id) {
            bail!("duplicate token {:?} in output", token_id);
        }
    }
    let minimal = minimal_alf_amount_per_tx_output(output.tokens.len());
    if output.amount < minimal {
        bail!(
            "output ALPH amount {} below the minimum {} for {} tokens",
            output.amount,
            minimal,
            output.tokens.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::constants::MINIMAL_ALF_PER_OUTPUT;
    use crate::vm::instr::Instr;
    use crate::vm::script::Method;

    fn lockup(byte: u8) -> LockupScript {
        LockupScript::P2pkh(H256([byte; 32]))
    }

    fn input(byte: u8) -> TxInput {
        TxInput {
            output_ref: AssetOutputRef {
                hint: byte as u32,
                key: H256([byte; 32]),
            },
            unlock_script: Bytes::new(),
        }
    }

    fn alf(units: u64) -> U256 {
        U256::from(MINIMAL_ALF_PER_OUTPUT) * U256::from(units)
    }

    #[test]
    fn test_build_computes_change() {
        let gas_price = U256::from(100u64);
        let gas_amount = 20_000u64;
        let fee = gas_price * U256::from(gas_amount);
        let tx = TxBuilder::new(0, gas_amount, gas_price, lockup(9))
            .add_input(input(1), AssetOutput::plain(alf(10), lockup(1)))
            .add_output(AssetOutput::plain(alf(3), lockup(2)))
            .build()
            .unwrap();
        assert_eq!(tx.fixed_outputs.len(), 2);
        let change = &tx.fixed_outputs[1];
        assert_eq!(change.lockup, lockup(9));
        assert_eq!(change.amount, alf(7) - fee);

        // conservation: inputs == outputs + fee
        let out_total: U256 = tx
            .fixed_outputs
            .iter()
            .fold(U256::zero(), |acc, o| acc + o.amount);
        assert_eq!(out_total + tx.gas_fee().unwrap(), alf(10));
    }

    #[test]
    fn test_duplicate_inputs_rejected() {
        let result = TxBuilder::new(0, 20_000, U256::one(), lockup(9))
            .add_input(input(1), AssetOutput::plain(alf(1), lockup(1)))
            .add_input(input(1), AssetOutput::plain(alf(1), lockup(1)))
            .build();
        assert!(result.unwrap_err().to_string().contains("duplicate input"));
    }

    #[test]
    fn test_new_token_rejected() {
        let token = H256([7u8; 32]);
        let mut output = AssetOutput::plain(alf(2), lockup(2));
        output.tokens.push((token, U256::from(5u8)));
        let result = TxBuilder::new(0, 20_000, U256::one(), lockup(9))
            .add_input(input(1), AssetOutput::plain(alf(10), lockup(1)))
            .add_output(output)
            .build();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("not present in any input"));
    }

    #[test]
    fn test_leftover_tokens_go_to_change() {
        let token = H256([7u8; 32]);
        let mut spent = AssetOutput::plain(alf(10), lockup(1));
        spent.tokens.push((token, U256::from(5u8)));
        let tx = TxBuilder::new(0, 20_000, U256::one(), lockup(9))
            .add_input(input(1), spent)
            .build()
            .unwrap();
        assert_eq!(tx.fixed_outputs.len(), 1);
        assert_eq!(tx.fixed_outputs[0].tokens, vec![(token, U256::from(5u8))]);
    }

    #[test]
    fn test_zero_token_amount_rejected() {
        let mut output = AssetOutput::plain(alf(2), lockup(2));
        output.tokens.push((H256([7u8; 32]), U256::zero()));
        let result = TxBuilder::new(0, 20_000, U256::one(), lockup(9))
            .add_input(input(1), AssetOutput::plain(alf(10), lockup(1)))
            .add_output(output)
            .build();
        assert!(result.unwrap_err().to_string().contains("zero token amount"));
    }

    #[test]
    fn test_minimal_amount_scales_with_tokens() {
        let token = H256([7u8; 32]);
        let mut spent = AssetOutput::plain(alf(10), lockup(1));
        spent.tokens.push((token, U256::from(5u8)));
        // one token demands a floor of 2 units, this output has only 1
        let mut output = AssetOutput::plain(alf(1), lockup(2));
        output.tokens.push((token, U256::from(5u8)));
        let result = TxBuilder::new(0, 20_000, U256::one(), lockup(9))
            .add_input(input(1), spent)
            .add_output(output)
            .build();
        assert!(result.unwrap_err().to_string().contains("below the minimum"));
    }

    #[test]
    fn test_insufficient_funds() {
        let result = TxBuilder::new(0, 20_000, U256::one(), lockup(9))
            .add_input(input(1), AssetOutput::plain(alf(1), lockup(1)))
            .add_output(AssetOutput::plain(alf(2), lockup(2)))
            .build();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("cannot cover outputs"));
    }

    #[test]
    fn test_serde_roundtrip_with_script() {
        let script = StatefulScript {
            fields: vec![],
            methods: vec![Method {
                is_public: true,
                is_payable: true,
                locals_type: vec![],
                return_type: vec![],
                instrs: vec![Instr::ConstTrue, Instr::Assert, Instr::Return],
            }],
        };
        let tx = TxBuilder::new(3, 20_000, U256::from(100u64), lockup(9))
            .with_script(script)
            .add_input(input(1), AssetOutput::plain(alf(10), lockup(1)))
            .build()
            .unwrap();
        let bytes = tx.serialization().unwrap();
        let decoded = UnsignedTransaction::deserialization(&bytes).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.serialization().unwrap(), bytes);
        assert_eq!(decoded.id().unwrap(), tx.id().unwrap());
    }
}
