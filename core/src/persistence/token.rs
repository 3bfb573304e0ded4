// Copyright 2020 The Trilith Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Validation and application of token requests.

use crate::{
    persistence::InvalidReason,
    requests::{ControllerAction, Payload, Request, Transaction},
    schema::{LedgerSchema, SchemaAccess},
    token::{transfer_fee, TokenAccount, TokenSetting},
    types::Amount,
};
use trilith_crypto::{Hash, ObjectHash};
use trilith_storage::Fork;

/// Validates a token request against the current ledger state.
///
/// `Send` and `ChangeRepresentative` payloads are not token requests and
/// pass through unchanged.
pub fn validate<A: SchemaAccess>(
    schema: &LedgerSchema<A>,
    request: &Request,
) -> Result<(), InvalidReason> {
    let origin = request.origin();
    match &request.payload {
        Payload::Send { .. } | Payload::ChangeRepresentative { .. } => Ok(()),

        Payload::IssueTokens {
            symbol,
            total_supply,
            ..
        } => {
            if symbol.is_empty() || symbol.len() > 8 {
                return Err(InvalidReason::BadSymbol);
            }
            if *total_supply == Amount::ZERO {
                return Err(InvalidReason::InsufficientTokenBalance);
            }
            if schema.token_account(&request.object_hash()).is_some() {
                return Err(InvalidReason::TokenExists);
            }
            Ok(())
        }

        Payload::DistributeTokens {
            token_id,
            transaction,
        } => {
            let token = controlled_token(schema, token_id, &origin)?;
            if token.central_supply.checked_sub(transaction.amount).is_none() {
                return Err(InvalidReason::InsufficientTokenBalance);
            }
            check_user(schema, &token, token_id, &transaction.destination, false)
        }

        Payload::RevokeTokens {
            token_id,
            source,
            transaction,
        } => {
            let token = controlled_token(schema, token_id, &origin)?;
            if !token.settings.is_enabled(TokenSetting::Revoke) {
                return Err(InvalidReason::SettingDisabled);
            }
            let holder = schema
                .account(source)
                .ok_or(InvalidReason::UnknownAccount)?;
            let balance = holder
                .token_entry(token_id)
                .map(|entry| entry.balance)
                .unwrap_or_default();
            if balance.checked_sub(transaction.amount).is_none() {
                return Err(InvalidReason::InsufficientTokenBalance);
            }
            Ok(())
        }

        Payload::FreezeTokens { token_id, .. } => {
            let token = controlled_token(schema, token_id, &origin)?;
            if !token.settings.is_enabled(TokenSetting::Freeze) {
                return Err(InvalidReason::SettingDisabled);
            }
            Ok(())
        }

        Payload::SetTokenFee { token_id, .. } => {
            let token = controlled_token(schema, token_id, &origin)?;
            if !token.settings.is_enabled(TokenSetting::AdjustFee) {
                return Err(InvalidReason::SettingDisabled);
            }
            Ok(())
        }

        Payload::UpdateWhitelist { token_id, .. } => {
            let token = controlled_token(schema, token_id, &origin)?;
            if !token.settings.is_enabled(TokenSetting::Whitelist) {
                return Err(InvalidReason::SettingDisabled);
            }
            Ok(())
        }

        Payload::UpdateController { token_id, .. } => {
            controlled_token(schema, token_id, &origin).map(drop)
        }

        Payload::BurnTokens { token_id, amount } => {
            let token = controlled_token(schema, token_id, &origin)?;
            if token.central_supply.checked_sub(*amount).is_none() {
                return Err(InvalidReason::InsufficientTokenBalance);
            }
            Ok(())
        }

        Payload::SendTokens {
            token_id,
            transactions,
        } => {
            let token = token_of(schema, token_id)?;
            check_user(schema, &token, token_id, &origin, true)?;

            let sender = schema
                .account(&origin)
                .ok_or(InvalidReason::UnknownAccount)?;
            let balance = sender
                .token_entry(token_id)
                .map(|entry| entry.balance)
                .unwrap_or_default();
            let total = token_total(&token, transactions)?;
            if balance.checked_sub(total).is_none() {
                return Err(InvalidReason::InsufficientTokenBalance);
            }
            for tx in transactions {
                check_user(schema, &token, token_id, &tx.destination, false)?;
            }
            Ok(())
        }

        Payload::ImmuteTokenSetting { token_id, setting } => {
            let token = controlled_token(schema, token_id, &origin)?;
            if !token.settings.is_mutable(*setting) {
                return Err(InvalidReason::SettingImmutable);
            }
            Ok(())
        }
    }
}

/// Applies a validated token request to the fork.
pub fn apply(fork: &mut Fork, request: &Request, current_epoch: u32) {
    let origin = request.origin();
    let digest = request.object_hash();
    let mut schema = LedgerSchema::new(fork);

    match &request.payload {
        Payload::Send { .. } | Payload::ChangeRepresentative { .. } => {}

        Payload::IssueTokens {
            symbol,
            total_supply,
            fee_type,
            fee_rate,
            settings,
            controllers,
        } => {
            let token = TokenAccount {
                issuer: origin,
                symbol: symbol.clone(),
                total_supply: *total_supply,
                central_supply: *total_supply,
                fee_type: *fee_type,
                fee_rate: *fee_rate,
                settings: *settings,
                controllers: controllers.clone(),
            };
            schema.put_token_account(&digest, &token);
        }

        Payload::DistributeTokens {
            token_id,
            transaction,
        } => {
            let mut token = existing_token(&schema, token_id);
            token.central_supply = token
                .central_supply
                .checked_sub(transaction.amount)
                .expect("validated central supply");
            schema.put_token_account(token_id, &token);
            credit_token(&mut schema, token_id, transaction, current_epoch);
        }

        Payload::RevokeTokens {
            token_id,
            source,
            transaction,
        } => {
            let mut holder = schema.account(source).expect("validated source account");
            let entry = holder.token_entry_mut(token_id);
            entry.balance = entry
                .balance
                .checked_sub(transaction.amount)
                .expect("validated token balance");
            schema.put_account(source, &holder);
            credit_token(&mut schema, token_id, transaction, current_epoch);
        }

        Payload::FreezeTokens {
            token_id,
            account,
            freeze,
        } => {
            let mut status = schema.token_user_status(token_id, account);
            status.frozen = *freeze;
            schema.put_token_user_status(token_id, account, status);
        }

        Payload::SetTokenFee {
            token_id,
            fee_type,
            fee_rate,
        } => {
            let mut token = existing_token(&schema, token_id);
            token.fee_type = *fee_type;
            token.fee_rate = *fee_rate;
            schema.put_token_account(token_id, &token);
        }

        Payload::UpdateWhitelist {
            token_id,
            account,
            whitelisted,
        } => {
            let mut status = schema.token_user_status(token_id, account);
            status.whitelisted = *whitelisted;
            schema.put_token_user_status(token_id, account, status);
        }

        Payload::UpdateController {
            token_id,
            action,
            controller,
        } => {
            let mut token = existing_token(&schema, token_id);
            match action {
                ControllerAction::Add => {
                    if !token.controllers.contains(controller) {
                        token.controllers.push(*controller);
                    }
                }
                ControllerAction::Remove => {
                    token.controllers.retain(|c| c != controller);
                }
            }
            schema.put_token_account(token_id, &token);
        }

        Payload::BurnTokens { token_id, amount } => {
            let mut token = existing_token(&schema, token_id);
            token.central_supply = token
                .central_supply
                .checked_sub(*amount)
                .expect("validated central supply");
            token.total_supply = token
                .total_supply
                .checked_sub(*amount)
                .expect("burn within total supply");
            schema.put_token_account(token_id, &token);
        }

        Payload::SendTokens {
            token_id,
            transactions,
        } => {
            let token = existing_token(&schema, token_id);
            let total = token_total(&token, transactions).expect("validated token total");
            let mut sender = schema.account(&origin).expect("validated origin");
            let entry = sender.token_entry_mut(token_id);
            entry.balance = entry
                .balance
                .checked_sub(total)
                .expect("validated token balance");
            schema.put_account(&origin, &sender);

            let mut fees = Amount::ZERO;
            for tx in transactions {
                fees += transfer_fee(&token, tx.amount);
                credit_token(&mut schema, token_id, tx, current_epoch);
            }
            // Transfer fees return to the central supply.
            let mut token = existing_token(&schema, token_id);
            token.central_supply = token
                .central_supply
                .checked_add(fees)
                .unwrap_or(token.central_supply);
            schema.put_token_account(token_id, &token);
        }

        Payload::ImmuteTokenSetting { token_id, setting } => {
            let mut token = existing_token(&schema, token_id);
            token.settings.make_immutable(*setting);
            schema.put_token_account(token_id, &token);
        }
    }
}

fn token_of<A: SchemaAccess>(
    schema: &LedgerSchema<A>,
    token_id: &Hash,
) -> Result<TokenAccount, InvalidReason> {
    schema
        .token_account(token_id)
        .ok_or(InvalidReason::UnknownToken)
}

fn controlled_token<A: SchemaAccess>(
    schema: &LedgerSchema<A>,
    token_id: &Hash,
    origin: &crate::types::AccountAddress,
) -> Result<TokenAccount, InvalidReason> {
    let token = token_of(schema, token_id)?;
    if !token.is_controller(origin) {
        return Err(InvalidReason::NotController);
    }
    Ok(token)
}

fn check_user<A: SchemaAccess>(
    schema: &LedgerSchema<A>,
    token: &TokenAccount,
    token_id: &Hash,
    account: &crate::types::AccountAddress,
    sending: bool,
) -> Result<(), InvalidReason> {
    let status = schema.token_user_status(token_id, account);
    if token.settings.is_enabled(TokenSetting::Whitelist) && !status.whitelisted {
        return Err(InvalidReason::NotWhitelisted);
    }
    if status.frozen && sending {
        return Err(InvalidReason::AccountFrozen);
    }
    Ok(())
}

fn token_total(
    token: &TokenAccount,
    transactions: &[Transaction],
) -> Result<Amount, InvalidReason> {
    let mut total = Amount::ZERO;
    for tx in transactions {
        total = total
            .checked_add(tx.amount)
            .and_then(|sum| sum.checked_add(transfer_fee(token, tx.amount)))
            .ok_or(InvalidReason::InsufficientTokenBalance)?;
    }
    Ok(total)
}

fn existing_token(schema: &LedgerSchema<&mut Fork>, token_id: &Hash) -> TokenAccount {
    schema
        .token_account(token_id)
        .expect("token validated to exist")
}

fn credit_token(
    schema: &mut LedgerSchema<&mut Fork>,
    token_id: &Hash,
    transaction: &Transaction,
    current_epoch: u32,
) {
    let mut account = schema
        .account(&transaction.destination)
        .unwrap_or_else(|| crate::account::Account::open(Amount::ZERO, current_epoch));
    let entry = account.token_entry_mut(token_id);
    entry.balance = entry
        .balance
        .checked_add(transaction.amount)
        .unwrap_or(entry.balance);
    schema.put_account(&transaction.destination, &account);
}
