//! Property-based tests: replicas converge no matter how transactions are
//! delivered, and chain compaction never changes what a list reads as.

use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;
use tandem::ClockMode;
use tandem::CoList;
use tandem::CoPlainText;
use tandem::Config;
use tandem::DocLog;
use tandem::Group;
use tandem::Header;
use tandem::OpId;
use tandem::Privacy;
use tandem::Session;
use tandem::SessionKey;
use tandem::id::SessionId;
use tandem::id::TxId;
use tandem::key::KeyPair;
use tandem::list::After;
use tandem::list::Before;
use tandem::list::ListOp;
use tandem::list::ListPacker;
use tandem::list::Packer;
use tandem::list::TextPacker;

const WRITERS: usize = 3;

// =============================================================================
// Test helpers
// =============================================================================

#[derive(Clone, Debug)]
enum Step {
    Append { writer: usize, pos_pct: f64, items: Vec<u8> },
    Prepend { writer: usize, pos_pct: f64, item: u8 },
    Delete { writer: usize, pos_pct: f64, len: usize },
    Sync { from: usize, to: usize },
}

fn arbitrary_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (0..WRITERS, 0.0..=1.0f64, prop::collection::vec(b'a'..=b'z', 1..5))
            .prop_map(|(writer, pos_pct, items)| Step::Append { writer, pos_pct, items }),
        2 => (0..WRITERS, 0.0..=1.0f64, b'A'..=b'Z')
            .prop_map(|(writer, pos_pct, item)| Step::Prepend { writer, pos_pct, item }),
        2 => (0..WRITERS, 0.0..=1.0f64, 1..3usize)
            .prop_map(|(writer, pos_pct, len)| Step::Delete { writer, pos_pct, len }),
        2 => (0..WRITERS, 0..WRITERS).prop_map(|(from, to)| Step::Sync { from, to }),
    ]
}

fn replica(header: &Header, group: &Arc<Group>, chains: bool) -> CoList {
    let config = Config {
        clock: ClockMode::Logical,
        chains,
        ..Config::default()
    };
    let log = DocLog::from_header(header.id(), header.clone(), group.clone(), config).unwrap();
    return CoList::new(log, Session::new(KeyPair::generate(), ClockMode::Logical)).unwrap();
}

fn send(from: &CoList, to: &mut CoList) {
    let known = to.log().known_state();
    let Some(content) = from.log().new_content_since(Some(&known)) else {
        return;
    };
    for (key, session) in &content.new {
        to.log_mut()
            .try_add_transactions(key, session.after, &session.transactions, &session.last_signature)
            .unwrap();
    }
    to.process_new_transactions().unwrap();
}

fn position(pct: f64, len: usize) -> usize {
    return ((pct * len as f64) as usize).min(len.saturating_sub(1));
}

fn run(list: &mut CoList, step: &Step) {
    let len = list.len();
    match step {
        Step::Append { pos_pct, items, .. } => {
            let after = if len == 0 { None } else { Some(position(*pos_pct, len)) };
            let items = items.iter().map(|b| json!((*b as char).to_string())).collect();
            list.append_items(items, after, Privacy::Trusting).unwrap();
        }
        Step::Prepend { pos_pct, item, .. } => {
            let before = ((*pos_pct * len as f64) as usize).min(len);
            list.prepend(json!((*item as char).to_string()), Some(before), Privacy::Trusting)
                .unwrap();
        }
        Step::Delete { pos_pct, len: count, .. } => {
            if len == 0 {
                return;
            }
            let start = position(*pos_pct, len);
            let end = (start + count).min(len);
            list.delete_range(start..end, Privacy::Trusting).unwrap();
        }
        Step::Sync { .. } => {}
    }
}

/// Play `steps` on a set of writers sharing one document.
fn play(steps: &[Step], chains: bool) -> (Header, Arc<Group>, Vec<CoList>) {
    let header = Header::plain_text();
    let group = Arc::new(Group::allow_all());
    let mut writers: Vec<CoList> = (0..WRITERS).map(|_| replica(&header, &group, chains)).collect();
    for step in steps {
        match step {
            Step::Sync { from, to } if from != to => {
                let (a, b) = if from < to {
                    let (lo, hi) = writers.split_at_mut(*to);
                    (&lo[*from], &mut hi[0])
                } else {
                    let (lo, hi) = writers.split_at_mut(*from);
                    (&hi[0], &mut lo[*to])
                };
                send(a, b);
            }
            Step::Sync { .. } => {}
            Step::Append { writer, .. } | Step::Prepend { writer, .. } | Step::Delete { writer, .. } => {
                run(&mut writers[*writer], step);
            }
        }
    }
    return (header, group, writers);
}

// =============================================================================
// Convergence
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn delivery_order_does_not_matter(
        steps in prop::collection::vec(arbitrary_step(), 1..30),
        order in Just((0..WRITERS).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let (header, group, writers) = play(&steps, true);

        let mut forward = replica(&header, &group, true);
        for writer in &writers {
            send(writer, &mut forward);
        }
        let mut shuffled = replica(&header, &group, true);
        for &i in &order {
            send(&writers[i], &mut shuffled);
        }
        prop_assert_eq!(forward.as_array(), shuffled.as_array());
        prop_assert_eq!(forward.op_ids(), shuffled.op_ids());
    }

    #[test]
    fn full_exchange_converges_every_writer(steps in prop::collection::vec(arbitrary_step(), 1..30)) {
        let (_, _, mut writers) = play(&steps, true);
        for _ in 0..2 {
            for from in 0..WRITERS {
                for to in 0..WRITERS {
                    if from == to {
                        continue;
                    }
                    let source = writers[from].log().new_content_since(Some(&writers[to].log().known_state()));
                    let Some(content) = source else {
                        continue;
                    };
                    let target = &mut writers[to];
                    for (key, session) in &content.new {
                        target
                            .log_mut()
                            .try_add_transactions(key, session.after, &session.transactions, &session.last_signature)
                            .unwrap();
                    }
                    target.process_new_transactions().unwrap();
                }
            }
        }
        for writer in &writers[1..] {
            prop_assert_eq!(writer.as_array(), writers[0].as_array());
        }
    }

    #[test]
    fn chains_do_not_change_the_result(steps in prop::collection::vec(arbitrary_step(), 1..40)) {
        let (header, group, writers) = play(&steps, true);
        let mut chained = replica(&header, &group, true);
        let mut plain = replica(&header, &group, false);
        for writer in &writers {
            send(writer, &mut chained);
            send(writer, &mut plain);
        }
        prop_assert_eq!(chained.op_ids(), plain.op_ids());
        prop_assert_eq!(plain.chain_stats().chains, 0);
        let stats = chained.chain_stats();
        prop_assert!(stats.chained_nodes <= stats.nodes);
    }

    #[test]
    fn redelivering_everything_is_a_no_op(steps in prop::collection::vec(arbitrary_step(), 1..20)) {
        let (header, group, writers) = play(&steps, true);
        let mut target = replica(&header, &group, true);
        for writer in &writers {
            send(writer, &mut target);
        }
        let before = target.op_ids().to_vec();
        for writer in &writers {
            let content = writer.log().new_content_since(None);
            let Some(content) = content else {
                continue;
            };
            for (key, session) in &content.new {
                let added = target
                    .log_mut()
                    .try_add_transactions(key, session.after, &session.transactions, &session.last_signature)
                    .unwrap();
                prop_assert_eq!(added, 0);
            }
        }
        prop_assert!(!target.process_new_transactions().unwrap());
        prop_assert_eq!(target.op_ids(), before.as_slice());
    }
}

// =============================================================================
// Packing
// =============================================================================

/// Single graphemes, including ones that fuse with their neighbours
/// when concatenated.
fn arbitrary_grapheme() -> impl Strategy<Value = &'static str> {
    return prop::sample::select(vec![
        "a", "b", " ", "\r", "\n", "\u{301}", "e\u{301}", "\u{200d}", "🇺", "🇸", "🇫", "🇺🇸", "👍", "👨‍👩‍👧", "ß",
    ]);
}

fn arbitrary_value() -> impl Strategy<Value = serde_json::Value> {
    return prop_oneof![
        6 => arbitrary_grapheme().prop_map(|g| json!(g)),
        1 => "[a-c]{2,3}".prop_map(|s| json!(s)),
        1 => any::<i32>().prop_map(|n| json!(n)),
    ];
}

fn arbitrary_op_id() -> impl Strategy<Value = OpId> {
    return (0..2u8, 0..4u32, 0..3u32).prop_map(|(writer, tx_index, change)| {
        let agent = KeyPair::from_seed([writer + 1; 32]).key_pub;
        let key = SessionKey::main(SessionId::with_nonce(agent, 0));
        return TxId { key, tx_index }.op(change);
    });
}

fn arbitrary_after() -> impl Strategy<Value = After> {
    return prop_oneof![Just(After::Start), arbitrary_op_id().prop_map(After::Op)];
}

fn arbitrary_before() -> impl Strategy<Value = Before> {
    return prop_oneof![Just(Before::End), arbitrary_op_id().prop_map(Before::Op)];
}

fn arbitrary_op() -> impl Strategy<Value = ListOp> {
    return prop_oneof![
        (arbitrary_value(), arbitrary_after()).prop_map(|(value, after)| ListOp::App { value, after }),
        (arbitrary_value(), arbitrary_before()).prop_map(|(value, before)| ListOp::Pre { value, before }),
        arbitrary_op_id().prop_map(|insertion| ListOp::Del { insertion }),
    ];
}

/// Batches shaped like what editing produces: appends sharing one anchor,
/// runs of deletions, or anything mixed.
fn arbitrary_text_ops() -> impl Strategy<Value = Vec<ListOp>> {
    let appends = (arbitrary_after(), prop::collection::vec(arbitrary_value(), 0..12)).prop_map(|(after, values)| {
        return values.into_iter().map(|value| ListOp::App { value, after }).collect::<Vec<_>>();
    });
    let typed = (arbitrary_after(), prop::collection::vec(arbitrary_grapheme(), 0..12)).prop_map(|(after, graphemes)| {
        return graphemes
            .into_iter()
            .map(|g| ListOp::App {
                value: json!(g),
                after,
            })
            .collect::<Vec<_>>();
    });
    let deletions = prop::collection::vec(arbitrary_op_id(), 0..8)
        .prop_map(|ids| ids.into_iter().map(|insertion| ListOp::Del { insertion }).collect::<Vec<_>>());
    let mixed = prop::collection::vec(arbitrary_op(), 0..12);
    return prop_oneof![3 => typed, 2 => appends, 2 => deletions, 2 => mixed];
}

fn plain_text() -> CoPlainText {
    let config = Config {
        clock: ClockMode::Logical,
        ..Config::default()
    };
    let header = Header::plain_text();
    let log = DocLog::from_header(header.id(), header, Arc::new(Group::allow_all()), config).unwrap();
    return CoPlainText::new(log, Session::new(KeyPair::generate(), ClockMode::Logical)).unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn packing_is_lossless(ops in arbitrary_text_ops()) {
        let packed = TextPacker.pack(&ops);
        prop_assert!(packed.len() <= ops.len());
        prop_assert_eq!(TextPacker.unpack(&packed).unwrap(), ops.clone());

        let packed = ListPacker.pack(&ops);
        prop_assert!(packed.len() <= ops.len());
        prop_assert_eq!(ListPacker.unpack(&packed).unwrap(), ops);
    }

    #[test]
    fn typed_text_reads_back(pieces in prop::collection::vec(prop_oneof![
        3 => arbitrary_grapheme().prop_map(str::to_string),
        1 => "[a-z ]{1,4}",
    ], 0..16)) {
        let input: String = pieces.concat();
        let mut doc = plain_text();
        doc.push_str(&input, Privacy::Trusting).unwrap();
        prop_assert_eq!(doc.to_string(), input.clone());

        doc.list_mut().rebuild().unwrap();
        prop_assert_eq!(doc.to_string(), input);
    }
}
