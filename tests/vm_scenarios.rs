//! End-to-end interpreter scenarios: scripts run against a fresh world state
//! with full gas accounting and output generation.

use bytes::Bytes;
use ethereum_types::{H256, U256};
use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::{Signature, SigningKey};

use alfvm::common::codec;
use alfvm::common::crypto::blake2b256;
use alfvm::lockup::LockupScript;
use alfvm::transaction::TxOutput;
use alfvm::vm::balance::{Balances, BalancesPerLockup};
use alfvm::vm::runtime::{execute_tx_script, BlockEnv, Runtime, TxEnv};
use alfvm::vm::script::{Method, StatefulContract, StatefulScript, StatelessScript};
use alfvm::vm::{Instr, Type, Val, VmError};
use alfvm::world_state::{ContractRecord, InMemoryWorldState, WorldState};

fn block_env() -> BlockEnv {
    BlockEnv {
        time_stamp: 1_600_000_000_000,
        target: U256::one() << 200,
    }
}

fn tx_env() -> TxEnv {
    TxEnv {
        tx_id: H256([0x42; 32]),
        signatures: vec![],
        first_input: None,
    }
}

fn entry_method(payable: bool, return_type: Vec<Type>, instrs: Vec<Instr>) -> Method {
    Method {
        is_public: true,
        is_payable: payable,
        locals_type: vec![],
        return_type,
        instrs,
    }
}

fn script_of(methods: Vec<Method>) -> StatefulScript {
    StatefulScript {
        fields: vec![],
        methods,
    }
}

fn address_of(byte: u8) -> LockupScript {
    LockupScript::P2pkh(H256([byte; 32]))
}

#[test]
fn test_const_and_arithmetic() {
    let script = StatelessScript {
        fields: vec![],
        methods: vec![entry_method(
            false,
            vec![Type::U256],
            vec![
                Instr::U256Const2,
                Instr::U256Const3,
                Instr::U256Add,
                Instr::Return,
            ],
        )],
    };
    let mut runtime = Runtime::stateless(block_env(), tx_env(), 1_000_000);
    let out = runtime
        .run_stateless_script(&script, vec![], vec![])
        .unwrap();
    assert_eq!(out, vec![Val::U256(U256::from(5u8))]);
    assert_eq!(runtime.gas_used(), 9);
}

#[test]
fn test_assert_pass() {
    let script = StatelessScript {
        fields: vec![],
        methods: vec![entry_method(
            false,
            vec![],
            vec![Instr::ConstTrue, Instr::Assert, Instr::Return],
        )],
    };
    let mut runtime = Runtime::stateless(block_env(), tx_env(), 1_000_000);
    let out = runtime
        .run_stateless_script(&script, vec![], vec![])
        .unwrap();
    assert!(out.is_empty());
    assert_eq!(runtime.gas_used(), 6);
}

#[test]
fn test_assert_fail_commits_nothing() {
    // the script deploys a contract and then trips an assertion; the deploy
    // must be rolled back with everything else
    let contract = StatefulContract {
        fields: vec![],
        methods: vec![entry_method(false, vec![], vec![Instr::Return])],
    };
    let code_bytes = contract.serialization().unwrap();
    let make_script = |fail: bool| {
        let mut instrs = vec![
            Instr::BytesConst(Bytes::from(code_bytes.clone())),
            Instr::BytesConst(Bytes::from(Val::encode_vec(&[]))),
            Instr::CreateContract,
        ];
        if fail {
            instrs.push(Instr::ConstFalse);
        } else {
            instrs.push(Instr::ConstTrue);
        }
        instrs.push(Instr::Assert);
        instrs.push(Instr::Return);
        script_of(vec![entry_method(true, vec![], instrs)])
    };

    // contract ids are seeded from the tx id when the tx spends no inputs
    let mut id_seed = tx_env().tx_id.as_bytes().to_vec();
    codec::encode_varint(0, &mut id_seed);
    let contract_id = blake2b256(&id_seed);

    let mut world = InMemoryWorldState::new();
    let result = execute_tx_script(
        &mut world,
        block_env(),
        tx_env(),
        1_000_000,
        &make_script(true),
        vec![],
        vec![],
        Balances::new(),
    );
    assert!(result.unwrap_err().to_string().contains("AssertionFailed"));
    assert!(!world.contract_exists(&contract_id));

    let result = execute_tx_script(
        &mut world,
        block_env(),
        tx_env(),
        1_000_000,
        &make_script(false),
        vec![],
        vec![],
        Balances::new(),
    );
    assert!(result.is_ok());
    assert!(world.contract_exists(&contract_id));
}

#[test]
fn test_call_local() {
    let script = StatelessScript {
        fields: vec![],
        methods: vec![
            entry_method(
                false,
                vec![Type::U256],
                vec![Instr::CallLocal(1), Instr::Return],
            ),
            Method {
                is_public: false,
                is_payable: false,
                locals_type: vec![],
                return_type: vec![Type::U256],
                instrs: vec![
                    Instr::U256Const1,
                    Instr::U256Const2,
                    Instr::U256Add,
                    Instr::Return,
                ],
            },
        ],
    };
    let mut runtime = Runtime::stateless(block_env(), tx_env(), 1_000_000);
    let out = runtime
        .run_stateless_script(&script, vec![], vec![])
        .unwrap();
    assert_eq!(out, vec![Val::U256(U256::from(3u8))]);
}

#[test]
fn test_transfer_conserves_balances() {
    let a = address_of(0xaa);
    let b = address_of(0xbb);
    let script = script_of(vec![entry_method(
        true,
        vec![],
        vec![
            Instr::AddressConst(a.clone()),
            Instr::AddressConst(b.clone()),
            Instr::U256Const(U256::from(7u8)),
            Instr::TransferAlf,
            Instr::Return,
        ],
    )]);
    let mut world = InMemoryWorldState::new();
    let result = execute_tx_script(
        &mut world,
        block_env(),
        tx_env(),
        1_000_000,
        &script,
        vec![],
        vec![],
        Balances::from_alf(a.clone(), U256::from(10u8)),
    )
    .unwrap();

    let mut amounts = std::collections::BTreeMap::new();
    for output in &result.generated_outputs {
        match output {
            TxOutput::Asset(out) => {
                amounts.insert(out.lockup.clone(), out.amount);
            }
            TxOutput::Contract(_) => panic!("no contract outputs expected"),
        }
    }
    assert_eq!(amounts.get(&a), Some(&U256::from(3u8)));
    assert_eq!(amounts.get(&b), Some(&U256::from(7u8)));
    let total: U256 = amounts.values().fold(U256::zero(), |acc, v| acc + *v);
    assert_eq!(total, U256::from(10u8));
}

#[test]
fn test_infinite_loop_runs_out_of_gas() {
    // Jump is 5 bytes wide; -5 from the position after it lands back on the
    // jump itself
    let script = StatelessScript {
        fields: vec![],
        methods: vec![entry_method(
            false,
            vec![],
            vec![Instr::U256Const0, Instr::Jump(-5)],
        )],
    };
    let mut runtime = Runtime::stateless(block_env(), tx_env(), 50);
    assert_eq!(
        runtime.run_stateless_script(&script, vec![], vec![]),
        Err(VmError::OutOfGas)
    );
}

#[test]
fn test_check_signature() {
    let secret = [0x3fu8; 32];
    let signing_key = SigningKey::from_slice(&secret).unwrap();
    let public_key = Bytes::copy_from_slice(&signing_key.verifying_key().to_sec1_bytes());

    let tx_id = H256([0x42; 32]);
    let sig: Signature = signing_key.sign_prehash(tx_id.as_bytes()).unwrap();

    let script = StatelessScript {
        fields: vec![],
        methods: vec![entry_method(
            false,
            vec![],
            vec![
                Instr::BytesConst(public_key.clone()),
                Instr::CheckSignature,
                Instr::Return,
            ],
        )],
    };

    let env = TxEnv {
        tx_id,
        signatures: vec![Bytes::copy_from_slice(&sig.to_bytes())],
        first_input: None,
    };
    let mut runtime = Runtime::stateless(block_env(), env, 1_000_000);
    assert!(runtime
        .run_stateless_script(&script, vec![], vec![])
        .is_ok());

    // same signature against a different tx id must fail
    let env = TxEnv {
        tx_id: H256([0x43; 32]),
        signatures: vec![Bytes::copy_from_slice(&sig.to_bytes())],
        first_input: None,
    };
    let mut runtime = Runtime::stateless(block_env(), env, 1_000_000);
    assert_eq!(
        runtime.run_stateless_script(&script, vec![], vec![]),
        Err(VmError::VerificationFailed)
    );

    // and a script with no signature left on the stack must fail
    let env = TxEnv {
        tx_id,
        signatures: vec![],
        first_input: None,
    };
    let mut runtime = Runtime::stateless(block_env(), env, 1_000_000);
    assert_eq!(
        runtime.run_stateless_script(&script, vec![], vec![]),
        Err(VmError::StackUnderflow)
    );
}

fn deploy(world: &mut InMemoryWorldState, id: H256, contract: StatefulContract) {
    let code_hash = contract.code_hash().unwrap();
    world.create_contract(
        id,
        ContractRecord {
            code: contract,
            code_hash,
            fields: vec![],
            asset: BalancesPerLockup::default(),
        },
    );
}

#[test]
fn test_external_call_with_approval() {
    let a = address_of(0xaa);
    let contract_id = H256([0xcc; 32]);

    // the contract pulls 5 approved ALPH from A into its own pool
    let contract = StatefulContract {
        fields: vec![],
        methods: vec![entry_method(
            true,
            vec![],
            vec![
                Instr::AddressConst(a.clone()),
                Instr::U256Const5,
                Instr::TransferAlfToSelf,
                Instr::Return,
            ],
        )],
    };
    let mut world = InMemoryWorldState::new();
    deploy(&mut world, contract_id, contract);

    let script = script_of(vec![entry_method(
        true,
        vec![],
        vec![
            Instr::AddressConst(a.clone()),
            Instr::U256Const5,
            Instr::ApproveAlf,
            Instr::BytesConst(Bytes::copy_from_slice(contract_id.as_bytes())),
            Instr::CallExternal(0),
            Instr::Return,
        ],
    )]);

    let result = execute_tx_script(
        &mut world,
        block_env(),
        tx_env(),
        1_000_000,
        &script,
        vec![],
        vec![],
        Balances::from_alf(a.clone(), U256::from(10u8)),
    )
    .unwrap();

    let mut contract_amount = U256::zero();
    let mut asset_amount = U256::zero();
    for output in &result.generated_outputs {
        match output {
            TxOutput::Contract(out) => contract_amount = out.amount,
            TxOutput::Asset(out) => {
                assert_eq!(out.lockup, a);
                asset_amount = out.amount;
            }
        }
    }
    assert_eq!(contract_amount, U256::from(5u8));
    assert_eq!(asset_amount, U256::from(5u8));

    // the contract's stored asset reflects what it now holds
    let record = world.load_contract(&contract_id).unwrap();
    assert_eq!(record.asset.alf, U256::from(5u8));
}

#[test]
fn test_private_method_rejected() {
    let contract_id = H256([0xcd; 32]);
    let contract = StatefulContract {
        fields: vec![],
        methods: vec![Method {
            is_public: false,
            is_payable: false,
            locals_type: vec![],
            return_type: vec![],
            instrs: vec![Instr::Return],
        }],
    };
    let mut world = InMemoryWorldState::new();
    deploy(&mut world, contract_id, contract);

    let script = script_of(vec![entry_method(
        false,
        vec![],
        vec![
            Instr::BytesConst(Bytes::copy_from_slice(contract_id.as_bytes())),
            Instr::CallExternal(0),
            Instr::Return,
        ],
    )]);
    let result = execute_tx_script(
        &mut world,
        block_env(),
        tx_env(),
        1_000_000,
        &script,
        vec![],
        vec![],
        Balances::new(),
    );
    assert!(result.unwrap_err().to_string().contains("PrivateMethod"));
}

#[test]
fn test_issue_token_once_per_tx() {
    let contract_id = H256([0xce; 32]);
    let issue_twice = StatefulContract {
        fields: vec![],
        methods: vec![entry_method(
            true,
            vec![],
            vec![
                Instr::U256Const5,
                Instr::IssueToken,
                Instr::U256Const5,
                Instr::IssueToken,
                Instr::Return,
            ],
        )],
    };
    let issue_once = StatefulContract {
        fields: vec![],
        methods: vec![entry_method(
            true,
            vec![],
            vec![Instr::U256Const5, Instr::IssueToken, Instr::Return],
        )],
    };

    let call_script = |id: H256| {
        script_of(vec![entry_method(
            true,
            vec![],
            vec![
                Instr::BytesConst(Bytes::copy_from_slice(id.as_bytes())),
                Instr::CallExternal(0),
                Instr::Return,
            ],
        )])
    };

    let mut world = InMemoryWorldState::new();
    deploy(&mut world, contract_id, issue_twice);
    let result = execute_tx_script(
        &mut world,
        block_env(),
        tx_env(),
        1_000_000,
        &call_script(contract_id),
        vec![],
        vec![],
        Balances::new(),
    );
    assert!(result.unwrap_err().to_string().contains("InvalidIssueToken"));

    let single_id = H256([0xcf; 32]);
    deploy(&mut world, single_id, issue_once);
    let result = execute_tx_script(
        &mut world,
        block_env(),
        tx_env(),
        1_000_000,
        &call_script(single_id),
        vec![],
        vec![],
        Balances::new(),
    )
    .unwrap();

    // newly issued tokens sit in the issuing contract's output
    let tokens: Vec<_> = result
        .generated_outputs
        .iter()
        .flat_map(|o| o.tokens().to_vec())
        .collect();
    assert_eq!(tokens, vec![(single_id, U256::from(5u8))]);
}

#[test]
fn test_destroy_contract_refunds_residual() {
    let a = address_of(0xaa);
    let contract_id = H256([0xd0; 32]);
    let contract = StatefulContract {
        fields: vec![],
        methods: vec![entry_method(
            true,
            vec![],
            vec![
                Instr::AddressConst(a.clone()),
                Instr::SelfContractId,
                Instr::DestroyContract,
                Instr::Return,
            ],
        )],
    };
    let code_hash = contract.code_hash().unwrap();
    let mut world = InMemoryWorldState::new();
    world.create_contract(
        contract_id,
        ContractRecord {
            code: contract,
            code_hash,
            fields: vec![],
            asset: BalancesPerLockup::alf_only(U256::from(100u8)),
        },
    );

    let script = script_of(vec![entry_method(
        true,
        vec![],
        vec![
            Instr::BytesConst(Bytes::copy_from_slice(contract_id.as_bytes())),
            Instr::CallExternal(0),
            Instr::Return,
        ],
    )]);
    let result = execute_tx_script(
        &mut world,
        block_env(),
        tx_env(),
        1_000_000,
        &script,
        vec![],
        vec![],
        Balances::new(),
    )
    .unwrap();

    assert!(!world.contract_exists(&contract_id));
    assert_eq!(result.generated_outputs.len(), 1);
    match &result.generated_outputs[0] {
        TxOutput::Asset(out) => {
            assert_eq!(out.lockup, a);
            assert_eq!(out.amount, U256::from(100u8));
        }
        TxOutput::Contract(_) => panic!("residual must refund to an asset output"),
    }
}
