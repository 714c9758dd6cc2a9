use guard_core::{ChainId, ShardingConfig, ValidatorId};
use guard_state::{partition, ShardingLayer};
use proptest::prelude::*;
use std::collections::HashMap;

fn validator_ids() -> impl Strategy<Value = Vec<ValidatorId>> {
    proptest::collection::hash_set("[a-z]{1,6}", 0..40)
        .prop_map(|ids| ids.into_iter().map(ValidatorId::new).collect())
}

proptest! {
    #[test]
    fn every_active_validator_lands_in_exactly_one_shard(
        validators in validator_ids(),
        shards in 1u32..9,
    ) {
        let layer = ShardingLayer::new(shards, ShardingConfig::default());
        let chain = ChainId::new("alpha");
        layer.assign_shards(&chain, &validators).unwrap();

        let mut seen: HashMap<ValidatorId, usize> = HashMap::new();
        for shard in layer.shards(&chain) {
            for validator in shard.validators {
                *seen.entry(validator).or_default() += 1;
            }
        }
        prop_assert_eq!(seen.len(), validators.len());
        prop_assert!(seen.values().all(|&count| count == 1));
    }

    #[test]
    fn partition_is_order_independent(validators in validator_ids(), shards in 1u32..9) {
        let mut reversed = validators.clone();
        reversed.reverse();
        prop_assert_eq!(partition(&validators, shards), partition(&reversed, shards));
    }

    #[test]
    fn rebalance_keeps_partition_and_work(
        validators in validator_ids(),
        txs in 0usize..60,
        shards in 1u32..6,
    ) {
        let layer = ShardingLayer::new(shards, ShardingConfig::default());
        let chain = ChainId::new("alpha");
        layer.assign_shards(&chain, &validators).unwrap();
        for i in 0..txs {
            layer.route_transaction(&chain, format!("tx{}", i)).unwrap();
        }
        layer.rebalance(&chain).unwrap();

        prop_assert_eq!(layer.pending(&chain), txs);
        let assigned: usize = layer.shards(&chain).iter().map(|s| s.validators.len()).sum();
        prop_assert_eq!(assigned, validators.len());
    }
}

#[test]
fn failed_round_returns_batch_to_the_front() {
    let layer = ShardingLayer::new(2, ShardingConfig::default());
    let chain = ChainId::new("alpha");
    layer.assign_shards(&chain, &[ValidatorId::new("v1"), ValidatorId::new("v2")]).unwrap();
    for i in 0..4 {
        layer.route_transaction(&chain, format!("tx{}", i)).unwrap();
    }

    layer.begin_round(&chain).unwrap();
    let batch = layer.take_batch(&chain, 2).unwrap();
    layer.route_transaction(&chain, "late").unwrap();
    layer.end_round(&chain, false).unwrap();
    layer.requeue(&chain, batch).unwrap();

    let next = layer.take_batch(&chain, 2).unwrap();
    assert_eq!(next.transactions(), vec!["tx0", "tx1"]);
}
