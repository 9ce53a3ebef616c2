use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde_json::json;
use vesper_aa::delegation::DelegationError;
use vesper_aa::{AaEngine, CreationError, DeployError, EngineConfig, ExecuteOptions, ExecutionError, OperationCall};
use vesper_chain::{LocalKeySigner, Signer, SignerError};
use vesper_common::{format_address, format_hash, parse_address, SecretBytes, VesperError};
use vesper_vault::Caveat;

#[derive(Parser, Debug)]
#[command(name = "vesper", version, about = "Smart-account operations from the command line")]
pub struct MainCmd {
    /// Hex private key of the owner EOA
    #[arg(long, env = "VESPER_OWNER_KEY", hide_env_values = true, global = true)]
    owner_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the deterministic smart-account address and deployment status
    Address,
    /// Deploy the smart account through a sponsored operation
    Deploy,
    /// Manage the session-key delegation
    #[command(subcommand)]
    Delegation(DelegationCmd),
    /// Execute a call from the smart account
    Execute(ExecuteArgs),
    /// Token-bound accounts
    #[command(subcommand)]
    Tba(TbaCmd),
}

#[derive(Subcommand, Debug)]
enum DelegationCmd {
    Enable(CaveatArgs),
    Disable,
    Status,
}

#[derive(Args, Debug)]
struct CaveatArgs {
    #[arg(long)]
    action_limit: Option<u64>,
    /// Max actions per `--period` seconds
    #[arg(long, requires = "period")]
    rate_limit: Option<u64>,
    #[arg(long)]
    period: Option<u64>,
    #[arg(long)]
    spending_limit_wei: Option<u128>,
}

#[derive(Args, Debug)]
struct ExecuteArgs {
    #[arg(long)]
    to: String,
    /// Hex call data
    #[arg(long, default_value = "0x")]
    data: String,
    #[arg(long, default_value_t = 0)]
    value: u128,
    /// Fail before signing unless the account holds at least this much
    #[arg(long)]
    require_balance: Option<u128>,
}

#[derive(Subcommand, Debug)]
enum TbaCmd {
    Create {
        #[arg(long)]
        token: String,
        #[arg(long)]
        id: u128,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Config(#[from] VesperError),
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error(transparent)]
    Deploy(#[from] DeployError),
    #[error(transparent)]
    Delegation(#[from] DelegationError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Creation(#[from] CreationError),
}

impl Error {
    /// Text shown to the user; raw detail goes to the log.
    pub fn user_message(&self) -> String {
        match self {
            Error::Execution(e) | Error::Deploy(DeployError::Execution(e)) | Error::Creation(CreationError::Execution(e)) => {
                e.user_message()
            }
            other => other.to_string(),
        }
    }

    pub fn is_silent(&self) -> bool {
        match self {
            Error::Execution(e) | Error::Deploy(DeployError::Execution(e)) | Error::Creation(CreationError::Execution(e)) => {
                e.is_silent()
            }
            Error::Delegation(DelegationError::Rejected) => true,
            _ => false,
        }
    }
}

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>, Error> {
    hex::decode(value.trim().trim_start_matches("0x")).map_err(|e| Error::Usage(format!("{field}: {e}")))
}

fn print(value: serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()));
}

impl MainCmd {
    fn owner_signer(&self) -> Result<Arc<dyn Signer>, Error> {
        let raw = self
            .owner_key
            .as_deref()
            .ok_or_else(|| Error::Usage("owner key required (--owner-key or VESPER_OWNER_KEY)".into()))?;
        let secret = SecretBytes(decode_hex("owner key", raw)?);
        Ok(Arc::new(LocalKeySigner::from_secret(&secret)?))
    }

    pub async fn run(self) -> Result<(), Error> {
        let engine = AaEngine::from_config(EngineConfig::from_env()?)?;
        let signer = self.owner_signer()?;
        let owner = signer.address();

        match &self.command {
            Command::Address => {
                let state = engine.accounts.sync_deployment(&owner).await?;
                print(json!({
                    "owner": format_address(&state.owner_address),
                    "account": format_address(&state.account_address),
                    "deployed": state.is_deployed,
                    "kind": state.implementation_kind,
                }));
            }
            Command::Deploy => {
                let state = engine.accounts.deploy(&owner, Some(signer.clone())).await?;
                print(json!({
                    "account": format_address(&state.account_address),
                    "deployed": state.is_deployed,
                }));
            }
            Command::Delegation(cmd) => {
                let account = engine.accounts.account(&owner, signer.clone()).await;
                match cmd {
                    DelegationCmd::Enable(args) => {
                        let grant = engine.delegations.enable(&account, caveats(args)).await?;
                        let caveats: Vec<_> = grant
                            .caveats
                            .iter()
                            .map(|c| match &c.result {
                                Ok(hash) => json!({ "caveat": c.caveat.name(), "operation": format_hash(hash) }),
                                Err(reason) => json!({ "caveat": c.caveat.name(), "error": reason }),
                            })
                            .collect();
                        print(json!({
                            "delegation": grant.record.id,
                            "session_key": format_address(&grant.record.session_key_address),
                            "valid_until": grant.record.valid_until,
                            "storage": grant.location,
                            "caveats": caveats,
                        }));
                    }
                    DelegationCmd::Disable => {
                        engine.delegations.disable(&owner, &account.address()).await?;
                        print(json!({ "delegation": "disabled" }));
                    }
                    DelegationCmd::Status => {
                        let location = engine.delegations.restore(&owner, &account.address()).await;
                        print(json!({
                            "active": engine.delegations.should_use_delegation(&owner, &account.address()),
                            "storage": location,
                        }));
                    }
                }
            }
            Command::Execute(args) => {
                let target = parse_address(&args.to)?;
                let call = OperationCall::new(target, decode_hex("data", &args.data)?).with_value(args.value);
                let options = match args.require_balance {
                    Some(wei) => ExecuteOptions::requiring_balance(wei),
                    None => ExecuteOptions::default(),
                };
                let account = engine.accounts.account(&owner, signer.clone()).await;
                engine.delegations.restore(&owner, &account.address()).await;
                let outcome = engine.delegations.execute_action(&account, &call, options).await?;
                let receipt = &outcome.submitted.receipt;
                print(json!({
                    "operation": format_hash(&outcome.submitted.operation_hash),
                    "reference": format_hash(&receipt.reference()),
                    "status": receipt.status,
                    "path": format!("{:?}", outcome.path),
                    "fell_back": outcome.fell_back,
                    "sponsored": outcome.submitted.sponsored,
                }));
            }
            Command::Tba(TbaCmd::Create { token, id }) => {
                let creator = engine
                    .tba
                    .clone()
                    .ok_or_else(|| Error::Usage("TBA creation needs VESPER_GAME_CONTRACT and VESPER_TBA_IMPLEMENTATION".into()))?;
                let token = parse_address(token)?;
                let account = engine.accounts.account(&owner, signer.clone()).await;
                let record = creator.create(&account, &token, *id).await?;
                print(serde_json::to_value(&record).map_err(VesperError::from)?);
            }
        }
        Ok(())
    }
}

fn caveats(args: &CaveatArgs) -> Vec<Caveat> {
    let mut caveats = Vec::new();
    if let Some(max_actions) = args.action_limit {
        caveats.push(Caveat::ActionLimit { max_actions });
    }
    if let (Some(max_actions), Some(period_secs)) = (args.rate_limit, args.period) {
        caveats.push(Caveat::RateLimit { max_actions, period_secs });
    }
    if let Some(max_wei) = args.spending_limit_wei {
        caveats.push(Caveat::SpendingLimit { max_wei });
    }
    caveats
}
