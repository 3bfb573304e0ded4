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

//! Token accounts.
//!
//! A token is created by an `IssueTokens` request; its identifier is the
//! digest of that request. The issuing account and the listed controllers
//! administer the token within the bounds of its settings: each
//! administrative capability has an *enabled* bit and a *mutable* bit, and a
//! capability whose mutable bit is cleared can never be flipped again.

use serde_derive::{Deserialize, Serialize};

use crate::{
    types::{AccountAddress, Amount},
    wire::{read_short_string, write_short_string, write_u16, WireDecode, WireEncode, WireError, WireReader},
};
use trilith_crypto::Hash;

/// How the per-transfer token fee is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenFeeType {
    /// A flat amount per transfer.
    Flat,
    /// A percentage of the transferred amount.
    Percentage,
}

impl TokenFeeType {
    fn code(self) -> u8 {
        match self {
            Self::Flat => 0,
            Self::Percentage => 1,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Flat),
            1 => Some(Self::Percentage),
            _ => None,
        }
    }
}

/// Administrative capabilities of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenSetting {
    /// Additional tokens may be issued.
    Issuance = 0,
    /// Tokens may be revoked from user accounts.
    Revoke = 1,
    /// User accounts may be frozen.
    Freeze = 2,
    /// The transfer fee may be adjusted.
    AdjustFee = 3,
    /// Transfers are restricted to whitelisted accounts.
    Whitelist = 4,
}

impl TokenSetting {
    const COUNT: u16 = 5;

    /// Wire code of the capability.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parses a capability from its wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Issuance,
            1 => Self::Revoke,
            2 => Self::Freeze,
            3 => Self::AdjustFee,
            4 => Self::Whitelist,
            _ => return None,
        })
    }

    fn enabled_bit(self) -> u16 {
        1 << (self as u16)
    }

    fn mutable_bit(self) -> u16 {
        1 << (self as u16 + Self::COUNT)
    }
}

/// A token's settings: an enabled bit and a mutable bit per capability,
/// packed into 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenSettings(pub u16);

impl TokenSettings {
    /// Settings with the given capabilities enabled, all of them mutable.
    pub fn enabled(settings: &[TokenSetting]) -> Self {
        let mut bits = 0;
        for setting in settings {
            bits |= setting.enabled_bit();
        }
        for i in 0..TokenSetting::COUNT {
            bits |= 1 << (i + TokenSetting::COUNT);
        }
        Self(bits)
    }

    /// Returns `true` if the capability is currently enabled.
    pub fn is_enabled(&self, setting: TokenSetting) -> bool {
        self.0 & setting.enabled_bit() != 0
    }

    /// Returns `true` if the capability may still be flipped.
    pub fn is_mutable(&self, setting: TokenSetting) -> bool {
        self.0 & setting.mutable_bit() != 0
    }

    /// Enables or disables a capability. The caller checks mutability.
    pub fn set_enabled(&mut self, setting: TokenSetting, enabled: bool) {
        if enabled {
            self.0 |= setting.enabled_bit();
        } else {
            self.0 &= !setting.enabled_bit();
        }
    }

    /// Clears the mutable bit of a capability, freezing it forever.
    pub fn make_immutable(&mut self, setting: TokenSetting) {
        self.0 &= !setting.mutable_bit();
    }
}

/// Whitelist/frozen status of one user account under one token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUserStatus {
    /// The account may take part in transfers while whitelisting is on.
    pub whitelisted: bool,
    /// The account's token balance is frozen.
    pub frozen: bool,
}

impl WireEncode for TokenUserStatus {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.whitelisted as u8);
        buf.push(self.frozen as u8);
    }
}

impl WireDecode for TokenUserStatus {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            whitelisted: r.read_bool()?,
            frozen: r.read_bool()?,
        })
    }
}

/// The administrative record of a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenAccount {
    /// Account that issued the token.
    pub issuer: AccountAddress,
    /// Short symbol of the token.
    pub symbol: String,
    /// Total supply, including the not-yet-distributed remainder.
    pub total_supply: Amount,
    /// Supply still held by the token account itself.
    pub central_supply: Amount,
    /// Transfer fee mode.
    pub fee_type: TokenFeeType,
    /// Transfer fee rate: an amount for [`TokenFeeType::Flat`], a percentage
    /// for [`TokenFeeType::Percentage`].
    pub fee_rate: Amount,
    /// Capability bits.
    pub settings: TokenSettings,
    /// Accounts allowed to administer the token besides the issuer.
    pub controllers: Vec<AccountAddress>,
}

impl TokenAccount {
    /// Returns `true` if `account` may administer this token.
    pub fn is_controller(&self, account: &AccountAddress) -> bool {
        *account == self.issuer || self.controllers.contains(account)
    }
}

impl WireEncode for TokenAccount {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.issuer.encode(buf);
        write_short_string(buf, &self.symbol);
        self.total_supply.encode(buf);
        self.central_supply.encode(buf);
        buf.push(self.fee_type.code());
        self.fee_rate.encode(buf);
        write_u16(buf, self.settings.0);
        buf.push(self.controllers.len() as u8);
        for controller in &self.controllers {
            controller.encode(buf);
        }
    }
}

impl WireDecode for TokenAccount {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let issuer = AccountAddress::decode(r)?;
        let symbol = read_short_string(r)?;
        let total_supply = Amount::decode(r)?;
        let central_supply = Amount::decode(r)?;
        let fee_type =
            TokenFeeType::from_code(r.read_u8()?).ok_or(WireError::Malformed("token fee type"))?;
        let fee_rate = Amount::decode(r)?;
        let settings = TokenSettings(r.read_u16()?);
        let controller_count = r.read_u8()? as usize;
        let mut controllers = Vec::with_capacity(controller_count);
        for _ in 0..controller_count {
            controllers.push(AccountAddress::decode(r)?);
        }
        Ok(Self {
            issuer,
            symbol,
            total_supply,
            central_supply,
            fee_type,
            fee_rate,
            settings,
            controllers,
        })
    }
}

/// Computes the fee of a token transfer of `amount`.
pub fn transfer_fee(token: &TokenAccount, amount: Amount) -> Amount {
    match token.fee_type {
        TokenFeeType::Flat => token.fee_rate,
        TokenFeeType::Percentage => Amount(amount.0 / 100 * token.fee_rate.0.min(100)),
    }
}

/// Storage key of a token user-status entry: `token_id ‖ account`.
pub fn user_status_key(token_id: &Hash, account: &AccountAddress) -> Vec<u8> {
    let mut key = Vec::with_capacity(64);
    key.extend_from_slice(token_id.as_bytes());
    key.extend_from_slice(account.as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn settings_bits() {
        let mut settings = TokenSettings::enabled(&[TokenSetting::Revoke, TokenSetting::Freeze]);
        assert!(settings.is_enabled(TokenSetting::Revoke));
        assert!(!settings.is_enabled(TokenSetting::Issuance));
        assert!(settings.is_mutable(TokenSetting::Issuance));

        settings.make_immutable(TokenSetting::Freeze);
        assert!(settings.is_enabled(TokenSetting::Freeze));
        assert!(!settings.is_mutable(TokenSetting::Freeze));

        settings.set_enabled(TokenSetting::Issuance, true);
        assert!(settings.is_enabled(TokenSetting::Issuance));
    }

    #[test]
    fn token_account_roundtrip() {
        use crate::wire::{WireDecode as _, WireEncode as _};

        let token = TokenAccount {
            issuer: AccountAddress([9; 32]),
            symbol: "TRI".to_owned(),
            total_supply: Amount(1_000_000),
            central_supply: Amount(400_000),
            fee_type: TokenFeeType::Flat,
            fee_rate: Amount(2),
            settings: TokenSettings::enabled(&[TokenSetting::Whitelist]),
            controllers: vec![AccountAddress([1; 32]), AccountAddress([2; 32])],
        };
        let restored = TokenAccount::from_wire(&token.to_wire()).unwrap();
        assert_eq!(restored, token);
    }
}
