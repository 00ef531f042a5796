//! The registry of bad transaction templates. Every template breaks exactly one rule and
//! advertises the reaction the target is expected to show, in the target's own reject
//! reason vocabulary.
use crate::{
    block_factory::{BlockFactory, BlockFactoryError},
    chainstate::SpendableOutput,
};
use bitcoin::{
    absolute::LockTime,
    hashes::Hash,
    opcodes::{
        all::{OP_PUSHBYTES_0, OP_RETURN},
        OP_TRUE,
    },
    script::Builder,
    transaction, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use std::fmt;

/// How the target is expected to react to a template's transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpectedOutcome {
    /// The reason given when the transaction is relayed on its own. `None` when the
    /// target does not reject it outright (e.g. it is kept as an orphan).
    pub reject_reason: Option<&'static str>,
    /// The reason given when the transaction is mined into a block, if it differs from
    /// `reject_reason`.
    pub block_reject_reason: Option<&'static str>,
    /// Whether relaying the transaction gets the peer disconnected.
    pub expect_disconnect: bool,
    /// Whether the transaction only violates policy and is valid once mined.
    pub valid_in_block: bool,
}

impl ExpectedOutcome {
    /// The reason a block containing the transaction is rejected with.
    pub fn block_reason(&self) -> Option<&'static str> {
        self.block_reject_reason.or(self.reject_reason)
    }
}

/// One rule violation. [BadTxTemplate::ALL] lists them in registration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BadTxTemplate {
    OutputMissing,
    InputMissing,
    SizeTooSmall,
    BadInputOutpointIndex,
    DuplicateInput,
    PrevoutNullInput,
    NonexistentInput,
    SpendTooMuch,
    CreateNegative,
    CreateTooLarge,
    CreateSumTooLarge,
}

impl BadTxTemplate {
    pub const ALL: [BadTxTemplate; 11] = [
        BadTxTemplate::OutputMissing,
        BadTxTemplate::InputMissing,
        BadTxTemplate::SizeTooSmall,
        BadTxTemplate::BadInputOutpointIndex,
        BadTxTemplate::DuplicateInput,
        BadTxTemplate::PrevoutNullInput,
        BadTxTemplate::NonexistentInput,
        BadTxTemplate::SpendTooMuch,
        BadTxTemplate::CreateNegative,
        BadTxTemplate::CreateTooLarge,
        BadTxTemplate::CreateSumTooLarge,
    ];

    /// Iterates the registry in registration order.
    pub fn iter() -> impl Iterator<Item = BadTxTemplate> {
        Self::ALL.into_iter()
    }

    pub fn name(&self) -> &'static str {
        match self {
            BadTxTemplate::OutputMissing => "OutputMissing",
            BadTxTemplate::InputMissing => "InputMissing",
            BadTxTemplate::SizeTooSmall => "SizeTooSmall",
            BadTxTemplate::BadInputOutpointIndex => "BadInputOutpointIndex",
            BadTxTemplate::DuplicateInput => "DuplicateInput",
            BadTxTemplate::PrevoutNullInput => "PrevoutNullInput",
            BadTxTemplate::NonexistentInput => "NonexistentInput",
            BadTxTemplate::SpendTooMuch => "SpendTooMuch",
            BadTxTemplate::CreateNegative => "CreateNegative",
            BadTxTemplate::CreateTooLarge => "CreateTooLarge",
            BadTxTemplate::CreateSumTooLarge => "CreateSumTooLarge",
        }
    }

    pub fn expected(&self) -> ExpectedOutcome {
        let consensus = |reason| ExpectedOutcome {
            reject_reason: Some(reason),
            block_reject_reason: None,
            expect_disconnect: true,
            valid_in_block: false,
        };
        let missing_inputs = ExpectedOutcome {
            reject_reason: None,
            block_reject_reason: Some("bad-txns-inputs-missingorspent"),
            expect_disconnect: false,
            valid_in_block: false,
        };
        match self {
            BadTxTemplate::OutputMissing => consensus("bad-txns-vout-empty"),
            BadTxTemplate::InputMissing => consensus("bad-txns-vin-empty"),
            BadTxTemplate::SizeTooSmall => ExpectedOutcome {
                reject_reason: Some("tx-size-small"),
                block_reject_reason: None,
                expect_disconnect: false,
                valid_in_block: true,
            },
            BadTxTemplate::BadInputOutpointIndex => missing_inputs,
            BadTxTemplate::DuplicateInput => consensus("bad-txns-inputs-duplicate"),
            BadTxTemplate::PrevoutNullInput => consensus("bad-txns-prevout-null"),
            BadTxTemplate::NonexistentInput => missing_inputs,
            BadTxTemplate::SpendTooMuch => consensus("bad-txns-in-belowout"),
            BadTxTemplate::CreateNegative => consensus("bad-txns-vout-negative"),
            BadTxTemplate::CreateTooLarge => consensus("bad-txns-vout-toolarge"),
            BadTxTemplate::CreateSumTooLarge => consensus("bad-txns-txouttotal-toolarge"),
        }
    }

    /// Creates a single-use instance of the template spending from `spend`.
    pub fn instantiate(self, spend: &SpendableOutput) -> BadTx {
        BadTx::new(self, spend)
    }
}

impl fmt::Display for BadTxTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A template bound to the transaction it spends from.
pub struct BadTx {
    template: BadTxTemplate,
    spend_tx: Transaction,
    spend_avail: Amount,
    valid_txin: TxIn,
}

impl BadTx {
    fn new(template: BadTxTemplate, spend: &SpendableOutput) -> Self {
        let spend_tx = spend.tx.clone();
        let spend_avail = spend.available();
        let valid_txin = txin(OutPoint::new(spend_tx.compute_txid(), 0));
        Self {
            template,
            spend_tx,
            spend_avail,
            valid_txin,
        }
    }

    pub fn template(&self) -> BadTxTemplate {
        self.template
    }

    pub fn expected(&self) -> ExpectedOutcome {
        self.template.expected()
    }

    /// The total value of the transaction being spent from.
    pub fn spend_avail(&self) -> Amount {
        self.spend_avail
    }

    /// The output the first input of [get_tx](BadTx::get_tx) claims to spend, when that
    /// input gets authorized. A `SizeTooSmall` transaction stays unsigned, since a signature
    /// would lift it above the size minimum it has to miss.
    pub fn spent_output(&self) -> Option<SpendableOutput> {
        match self.template {
            BadTxTemplate::InputMissing | BadTxTemplate::SizeTooSmall => None,
            _ => Some(SpendableOutput {
                tx: self.spend_tx.clone(),
                vout: 0,
            }),
        }
    }

    /// The transaction of [get_tx](BadTx::get_tx) with its first input authorized by
    /// `factory` where [spent_output](BadTx::spent_output) asks for it.
    pub fn authorized_tx(&self, factory: &BlockFactory) -> Result<Transaction, BlockFactoryError> {
        let mut tx = self.get_tx();
        if let Some(spent) = self.spent_output() {
            factory.sign_tx(&mut tx, &spent)?;
        }
        Ok(tx)
    }

    /// Builds the violating transaction. The result is deterministic for a given spend.
    pub fn get_tx(&self) -> Transaction {
        let op_true = Builder::new().push_opcode(OP_TRUE).into_script();
        let (input, output) = match self.template {
            BadTxTemplate::OutputMissing => (vec![self.valid_txin.clone()], vec![]),
            // No inputs and no outputs, so that the transaction cannot be mistaken for
            // one with witness data while being decoded.
            BadTxTemplate::InputMissing => (vec![], vec![]),
            BadTxTemplate::SizeTooSmall => {
                // 60 bytes of fixed fields plus a 4 byte script: one below the minimum.
                let script = Builder::new()
                    .push_opcode(OP_RETURN)
                    .push_opcode(OP_PUSHBYTES_0)
                    .push_opcode(OP_PUSHBYTES_0)
                    .push_opcode(OP_PUSHBYTES_0)
                    .into_script();
                (vec![self.valid_txin.clone()], vec![txout(Amount::ZERO, script)])
            }
            BadTxTemplate::BadInputOutpointIndex => {
                let bad_index = self.spend_tx.output.len() as u32 + 100;
                (
                    vec![txin(OutPoint::new(self.spend_tx.compute_txid(), bad_index))],
                    vec![txout(Amount::ZERO, op_true)],
                )
            }
            BadTxTemplate::DuplicateInput => (
                vec![self.valid_txin.clone(), self.valid_txin.clone()],
                vec![txout(self.spend_avail, op_true)],
            ),
            BadTxTemplate::PrevoutNullInput => (
                vec![self.valid_txin.clone(), txin(OutPoint::null())],
                vec![txout(self.spend_avail, op_true)],
            ),
            BadTxTemplate::NonexistentInput => {
                let mut bytes = self.spend_tx.compute_txid().to_byte_array();
                bytes[0] = bytes[0].wrapping_add(1);
                (
                    vec![
                        txin(OutPoint::new(Txid::from_byte_array(bytes), 0)),
                        self.valid_txin.clone(),
                    ],
                    vec![txout(self.spend_avail, op_true)],
                )
            }
            BadTxTemplate::SpendTooMuch => (
                vec![self.valid_txin.clone()],
                vec![txout(self.spend_avail + Amount::from_sat(1), op_true)],
            ),
            // The all-ones value is -1 once read back as a signed 64-bit integer.
            BadTxTemplate::CreateNegative => (
                vec![self.valid_txin.clone()],
                vec![txout(Amount::from_sat(u64::MAX), op_true)],
            ),
            BadTxTemplate::CreateTooLarge => (
                vec![self.valid_txin.clone()],
                vec![txout(Amount::MAX_MONEY + Amount::from_sat(1), op_true)],
            ),
            BadTxTemplate::CreateSumTooLarge => (
                vec![self.valid_txin.clone()],
                vec![
                    txout(Amount::MAX_MONEY, op_true.clone()),
                    txout(Amount::MAX_MONEY, op_true),
                ],
            ),
        };
        Transaction {
            version: transaction::Version::ONE,
            lock_time: LockTime::ZERO,
            input,
            output,
        }
    }
}

fn txin(previous_output: OutPoint) -> TxIn {
    TxIn {
        previous_output,
        script_sig: ScriptBuf::new(),
        sequence: Sequence::MAX,
        witness: Witness::new(),
    }
}

fn txout(value: Amount, script_pubkey: ScriptBuf) -> TxOut {
    TxOut {
        value,
        script_pubkey,
    }
}
