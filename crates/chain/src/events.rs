//! Positional decoding of lending-protocol and oracle logs.
//!
//! Events are recognized by their topic-0 signature. Topics carry the
//! indexed parameters, data the rest; both are decoded positionally.
//! Malformed logs decode to `None` and are skipped, never fatal.

use alloy::primitives::{b256, Address, B256, I256, U256};
use alloy::rpc::types::Log;
use tracing::debug;

/// `Borrow(address indexed reserve, address indexed user, uint256 amount, ...)`
pub const BORROW_SIGNATURE: B256 =
    b256!("c6a898309e823ee50bac64e45ca8adba6690e99e7841c45d754e2a38e9019d9b");

/// `Repay(address indexed reserve, address indexed user, address indexed repayer, uint256 amount)`
pub const REPAY_SIGNATURE: B256 =
    b256!("4cdde6e09bb755c9a5589ebaec640bbfedff1362d4b255ebf8339782b9942faa");

/// `LiquidationCall(address indexed collateralAsset, address indexed debtAsset, address indexed user, ...)`
pub const LIQUIDATION_SIGNATURE: B256 =
    b256!("e413a321e8681d831f4dbccbca790d2952b56f977908e45be37335533e005286");

/// `AnswerUpdated(int256 indexed current, uint256 indexed roundId, uint256 updatedAt)`
pub const ANSWER_UPDATED_SIGNATURE: B256 =
    b256!("0559884fd3a460db3073b7fc896cc77986f16e378210ded43186175bf646fc5f");

/// Decoded protocol or oracle event, tagged with its emitting contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    Borrow {
        contract: Address,
        reserve: Address,
        user: Address,
        amount: U256,
        block_number: u64,
    },
    Repay {
        contract: Address,
        reserve: Address,
        user: Address,
        amount: U256,
        block_number: u64,
    },
    Liquidation {
        contract: Address,
        collateral_asset: Address,
        debt_asset: Address,
        user: Address,
        block_number: u64,
    },
    PriceUpdated {
        oracle: Address,
        price: U256,
        round_id: U256,
        block_number: u64,
    },
}

impl ProtocolEvent {
    pub fn contract(&self) -> Address {
        match self {
            Self::Borrow { contract, .. }
            | Self::Repay { contract, .. }
            | Self::Liquidation { contract, .. } => *contract,
            Self::PriceUpdated { oracle, .. } => *oracle,
        }
    }

    pub fn block_number(&self) -> u64 {
        match self {
            Self::Borrow { block_number, .. }
            | Self::Repay { block_number, .. }
            | Self::Liquidation { block_number, .. }
            | Self::PriceUpdated { block_number, .. } => *block_number,
        }
    }
}

/// Decode one log. Unknown signatures and malformed payloads return
/// `None`.
pub fn decode_log(log: &Log) -> Option<ProtocolEvent> {
    let signature = log.topic0()?;
    let block_number = log.block_number.unwrap_or(0);

    if *signature == BORROW_SIGNATURE {
        decode_borrow(log, block_number)
    } else if *signature == REPAY_SIGNATURE {
        decode_repay(log, block_number)
    } else if *signature == LIQUIDATION_SIGNATURE {
        decode_liquidation(log, block_number)
    } else if *signature == ANSWER_UPDATED_SIGNATURE {
        decode_answer_updated(log, block_number)
    } else {
        None
    }
}

fn topic_address(log: &Log, index: usize) -> Option<Address> {
    let topic = log.topics().get(index)?;
    Some(Address::from_slice(&topic[12..]))
}

fn data_word(log: &Log, word: usize) -> Option<U256> {
    let data = &log.data().data;
    let start = word * 32;
    if data.len() < start + 32 {
        return None;
    }
    Some(U256::from_be_slice(&data[start..start + 32]))
}

fn decode_borrow(log: &Log, block_number: u64) -> Option<ProtocolEvent> {
    if log.topics().len() < 3 {
        return None;
    }
    Some(ProtocolEvent::Borrow {
        contract: log.address(),
        reserve: topic_address(log, 1)?,
        user: topic_address(log, 2)?,
        amount: data_word(log, 0)?,
        block_number,
    })
}

fn decode_repay(log: &Log, block_number: u64) -> Option<ProtocolEvent> {
    if log.topics().len() < 3 {
        return None;
    }
    Some(ProtocolEvent::Repay {
        contract: log.address(),
        reserve: topic_address(log, 1)?,
        user: topic_address(log, 2)?,
        amount: data_word(log, 0)?,
        block_number,
    })
}

fn decode_liquidation(log: &Log, block_number: u64) -> Option<ProtocolEvent> {
    if log.topics().len() < 4 {
        return None;
    }
    Some(ProtocolEvent::Liquidation {
        contract: log.address(),
        collateral_asset: topic_address(log, 1)?,
        debt_asset: topic_address(log, 2)?,
        user: topic_address(log, 3)?,
        block_number,
    })
}

fn decode_answer_updated(log: &Log, block_number: u64) -> Option<ProtocolEvent> {
    if log.topics().len() < 3 {
        return None;
    }
    // Price is the indexed int256 in topic 1; negative answers are junk.
    let raw = I256::from_be_bytes(log.topics()[1].0);
    if raw.is_negative() {
        debug!(oracle = %log.address(), "negative oracle answer, ignoring");
        return None;
    }
    Some(ProtocolEvent::PriceUpdated {
        oracle: log.address(),
        price: raw.into_raw(),
        round_id: U256::from_be_bytes(log.topics()[2].0),
        block_number,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Bytes, LogData};

    fn address_topic(address: Address) -> B256 {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(address.as_slice());
        B256::from(word)
    }

    fn amount_word(amount: U256) -> Vec<u8> {
        amount.to_be_bytes::<32>().to_vec()
    }

    fn synthetic_log(
        contract: Address,
        topics: Vec<B256>,
        data: Vec<u8>,
        block_number: u64,
    ) -> Log {
        Log {
            inner: alloy::primitives::Log {
                address: contract,
                data: LogData::new_unchecked(topics, Bytes::from(data)),
            },
            block_hash: None,
            block_number: Some(block_number),
            block_timestamp: None,
            transaction_hash: None,
            transaction_index: None,
            log_index: None,
            removed: false,
        }
    }

    fn borrow_log(contract: Address, user: Address, amount: U256, block: u64) -> Log {
        synthetic_log(
            contract,
            vec![
                BORROW_SIGNATURE,
                address_topic(Address::repeat_byte(0xEE)),
                address_topic(user),
            ],
            amount_word(amount),
            block,
        )
    }

    #[test]
    fn decodes_borrow_positionally() {
        let contract = Address::repeat_byte(0x11);
        let user = Address::repeat_byte(0x22);
        let log = borrow_log(contract, user, U256::from(5000u64), 77);

        match decode_log(&log).unwrap() {
            ProtocolEvent::Borrow { contract: c, user: u, amount, block_number, .. } => {
                assert_eq!(c, contract);
                assert_eq!(u, user);
                assert_eq!(amount, U256::from(5000u64));
                assert_eq!(block_number, 77);
            }
            other => panic!("decoded wrong variant: {other:?}"),
        }
    }

    #[test]
    fn decodes_repay_and_liquidation() {
        let contract = Address::repeat_byte(0x11);
        let user = Address::repeat_byte(0x22);

        let repay = synthetic_log(
            contract,
            vec![
                REPAY_SIGNATURE,
                address_topic(Address::repeat_byte(0xEE)),
                address_topic(user),
                address_topic(user),
            ],
            amount_word(U256::from(900u64)),
            78,
        );
        assert!(matches!(
            decode_log(&repay).unwrap(),
            ProtocolEvent::Repay { amount, .. } if amount == U256::from(900u64)
        ));

        let liquidation = synthetic_log(
            contract,
            vec![
                LIQUIDATION_SIGNATURE,
                address_topic(Address::repeat_byte(0xAA)),
                address_topic(Address::repeat_byte(0xBB)),
                address_topic(user),
            ],
            amount_word(U256::from(1u64)),
            79,
        );
        assert!(matches!(
            decode_log(&liquidation).unwrap(),
            ProtocolEvent::Liquidation { user: u, .. } if u == user
        ));
    }

    #[test]
    fn decodes_price_update_from_topic() {
        let oracle = Address::repeat_byte(0x33);
        let price = U256::from(200_000_000_000u64); // $2000 at 8 decimals
        let log = synthetic_log(
            oracle,
            vec![
                ANSWER_UPDATED_SIGNATURE,
                B256::from(price.to_be_bytes::<32>()),
                B256::from(U256::from(42u64).to_be_bytes::<32>()),
            ],
            amount_word(U256::from(1_700_000_000u64)),
            80,
        );

        match decode_log(&log).unwrap() {
            ProtocolEvent::PriceUpdated { oracle: o, price: p, round_id, .. } => {
                assert_eq!(o, oracle);
                assert_eq!(p, price);
                assert_eq!(round_id, U256::from(42u64));
            }
            other => panic!("decoded wrong variant: {other:?}"),
        }
    }

    #[test]
    fn negative_oracle_answer_is_dropped() {
        let negative = I256::try_from(-1i64).unwrap();
        let log = synthetic_log(
            Address::repeat_byte(0x33),
            vec![
                ANSWER_UPDATED_SIGNATURE,
                B256::from(negative.into_raw().to_be_bytes::<32>()),
                B256::from(U256::from(1u64).to_be_bytes::<32>()),
            ],
            vec![],
            81,
        );
        assert!(decode_log(&log).is_none());
    }

    #[test]
    fn unknown_signature_and_short_payloads_are_ignored() {
        let unknown = synthetic_log(
            Address::repeat_byte(0x11),
            vec![B256::repeat_byte(0xFF)],
            vec![],
            82,
        );
        assert!(decode_log(&unknown).is_none());

        // Borrow with missing amount data.
        let truncated = synthetic_log(
            Address::repeat_byte(0x11),
            vec![
                BORROW_SIGNATURE,
                address_topic(Address::repeat_byte(0xEE)),
                address_topic(Address::repeat_byte(0x22)),
            ],
            vec![0u8; 16],
            83,
        );
        assert!(decode_log(&truncated).is_none());
    }

    #[test]
    fn borrow_amounts_sum_over_a_block() {
        // Sum of decoded increments equals the sum of event amounts.
        let contract = Address::repeat_byte(0x11);
        let user = Address::repeat_byte(0x22);
        let amounts = [100u64, 250, 4650];

        let total: U256 = amounts
            .iter()
            .map(|a| borrow_log(contract, user, U256::from(*a), 90))
            .filter_map(|log| match decode_log(&log) {
                Some(ProtocolEvent::Borrow { amount, .. }) => Some(amount),
                _ => None,
            })
            .fold(U256::ZERO, |acc, a| acc + a);

        assert_eq!(total, U256::from(5000u64));
    }
}
