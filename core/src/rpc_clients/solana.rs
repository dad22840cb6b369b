//! Minimal Solana JSON-RPC client. Only `getTransaction` with `jsonParsed`
//! encoding is needed: verification is read-only, so the full SDK stack is
//! not pulled in.

use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use crate::error::{ReqwestErrorExt, VerificationError};

#[derive(Clone)]
pub struct SolanaRpcClient {
    http: reqwest::Client,
    url: Url,
    network_id: u64,
}

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// `getTransaction` result with `jsonParsed` encoding.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedTransactionWithMeta {
    pub slot: u64,
    pub block_time: Option<i64>,
    pub meta: Option<TransactionMeta>,
    pub transaction: ParsedTransaction,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMeta {
    pub err: Option<serde_json::Value>,
    #[serde(default)]
    pub post_token_balances: Vec<TokenBalance>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBalance {
    pub account_index: usize,
    pub mint: String,
    pub owner: Option<String>,
    pub ui_token_amount: UiTokenAmount,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiTokenAmount {
    pub ui_amount: Option<f64>,
    pub decimals: u8,
    pub amount: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParsedTransaction {
    pub signatures: Vec<String>,
    pub message: ParsedMessage,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedMessage {
    pub account_keys: Vec<AccountKey>,
    pub instructions: Vec<ParsedInstruction>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountKey {
    pub pubkey: String,
}

/// An instruction in a `jsonParsed` message. Instructions of programs the
/// node cannot parse come back without the `parsed` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedInstruction {
    pub program: Option<String>,
    pub program_id: String,
    pub parsed: Option<ParsedInstructionPayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParsedInstructionPayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub info: serde_json::Value,
}

impl SolanaRpcClient {
    pub fn new(
        http: reqwest::Client,
        url: &str,
        network_id: u64,
    ) -> Result<Self, VerificationError> {
        let url = Url::parse(url).map_err(|e| VerificationError::Config {
            message: format!("Invalid Solana RPC URL {url}: {e}"),
        })?;

        Ok(Self {
            http,
            url,
            network_id,
        })
    }

    pub async fn get_transaction(
        &self,
        signature: &str,
    ) -> Result<Option<ParsedTransactionWithMeta>, VerificationError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method: "getTransaction",
            params: json!([
                signature,
                {
                    "encoding": "jsonParsed",
                    "commitment": "confirmed",
                    "maxSupportedTransactionVersion": 0
                }
            ]),
        };

        let response: JsonRpcResponse<ParsedTransactionWithMeta> = self
            .http
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| e.to_rpc_error(self.network_id))?
            .json()
            .await
            .map_err(|e| e.to_rpc_error(self.network_id))?;

        if let Some(error) = response.error {
            return Err(VerificationError::Rpc {
                network_id: self.network_id,
                message: format!("getTransaction failed (code {}): {}", error.code, error.message),
            });
        }

        // A null result means the signature is unknown to the cluster, which
        // the caller maps onto NotFound/Pending handling.
        Ok(response.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_parsed_system_transfer() {
        let json = serde_json::json!({
            "slot": 253489012,
            "blockTime": 1712250000,
            "meta": { "err": null, "postTokenBalances": [] },
            "transaction": {
                "signatures": ["5s1DpkDBvQ6EkjBjg1dUPSLeSBG6pQRFnn7v6zSGbZWcBzCq9EFYgJzGPqoeZenu1RPLBCqWQ1BdPdLovDUnZCkF"],
                "message": {
                    "accountKeys": [
                        { "pubkey": "BxUK9tDLeMT7AkTR2jBTQQYUxGGw6nuWbQqGtiHHfftn", "signer": true, "writable": true },
                        { "pubkey": "7kZqm8yBas2AiCyhDWXrM5Y6vDkhYFhE4RGSnrmvipyy", "signer": false, "writable": true }
                    ],
                    "instructions": [{
                        "program": "system",
                        "programId": "11111111111111111111111111111111",
                        "parsed": {
                            "type": "transfer",
                            "info": {
                                "source": "BxUK9tDLeMT7AkTR2jBTQQYUxGGw6nuWbQqGtiHHfftn",
                                "destination": "7kZqm8yBas2AiCyhDWXrM5Y6vDkhYFhE4RGSnrmvipyy",
                                "lamports": 1000000u64
                            }
                        }
                    }]
                }
            }
        });

        let tx: ParsedTransactionWithMeta = serde_json::from_value(json).unwrap();
        assert_eq!(tx.block_time, Some(1712250000));
        let instruction = &tx.transaction.message.instructions[0];
        assert_eq!(instruction.program.as_deref(), Some("system"));
        assert_eq!(instruction.parsed.as_ref().unwrap().kind, "transfer");
    }
}
