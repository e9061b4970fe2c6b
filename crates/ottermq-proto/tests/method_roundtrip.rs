//! Property-based tests for method encoding/decoding.
//!
//! For every method in the supported table, `decode(encode(m)) == m` must
//! hold for arbitrary values drawn from the method's field domains. Strings
//! are restricted to what the wire allows (short strings ≤ 255 bytes of
//! UTF-8); everything else ranges over the full domain.

use ottermq_proto::{
    BasicMethod, ChannelMethod, ConnectionMethod, ExchangeMethod, FieldTable, FieldValue, Method,
    QueueMethod,
};
use proptest::prelude::*;

/// Short strings: printable ASCII, bounded well under the 255-byte cap.
fn arb_name() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_./-]{0,64}"
}

fn arb_text() -> impl Strategy<Value = String> {
    "[ -~]{0,80}"
}

fn arb_field_value() -> impl Strategy<Value = FieldValue> {
    let leaf = prop_oneof![
        arb_text().prop_map(FieldValue::LongString),
        any::<i32>().prop_map(FieldValue::Int),
        any::<bool>().prop_map(FieldValue::Bool),
        any::<i64>().prop_map(FieldValue::Long),
        any::<i64>().prop_map(FieldValue::Timestamp),
    ];
    leaf.prop_recursive(2, 8, 4, |inner| {
        prop::collection::vec((arb_name(), inner), 0..4)
            .prop_map(|entries| FieldValue::Table(entries.into_iter().collect()))
    })
}

fn arb_table() -> impl Strategy<Value = FieldTable> {
    prop::collection::vec((arb_name(), arb_field_value()), 0..6)
        .prop_map(|entries| entries.into_iter().collect())
}

fn arb_connection_method() -> impl Strategy<Value = ConnectionMethod> {
    prop_oneof![
        (arb_table(), arb_text(), arb_text()).prop_map(|(props, mechanisms, locales)| {
            ConnectionMethod::Start {
                version_major: 0,
                version_minor: 9,
                server_properties: props,
                mechanisms,
                locales,
            }
        }),
        (arb_table(), arb_name(), prop::collection::vec(any::<u8>(), 0..64), arb_name()).prop_map(
            |(props, mechanism, response, locale)| ConnectionMethod::StartOk {
                client_properties: props,
                mechanism,
                response,
                locale,
            }
        ),
        prop::collection::vec(any::<u8>(), 0..64)
            .prop_map(|challenge| ConnectionMethod::Secure { challenge }),
        prop::collection::vec(any::<u8>(), 0..64)
            .prop_map(|response| ConnectionMethod::SecureOk { response }),
        (any::<u16>(), any::<u32>(), any::<u16>()).prop_map(
            |(channel_max, frame_max, heartbeat)| ConnectionMethod::Tune {
                channel_max,
                frame_max,
                heartbeat
            }
        ),
        (any::<u16>(), any::<u32>(), any::<u16>()).prop_map(
            |(channel_max, frame_max, heartbeat)| ConnectionMethod::TuneOk {
                channel_max,
                frame_max,
                heartbeat
            }
        ),
        arb_name().prop_map(|virtual_host| ConnectionMethod::Open { virtual_host }),
        Just(ConnectionMethod::OpenOk),
        (any::<u16>(), arb_text(), any::<u16>(), any::<u16>()).prop_map(
            |(reply_code, reply_text, class_id, method_id)| ConnectionMethod::Close {
                reply_code,
                reply_text,
                class_id,
                method_id,
            }
        ),
        Just(ConnectionMethod::CloseOk),
    ]
}

fn arb_channel_method() -> impl Strategy<Value = ChannelMethod> {
    prop_oneof![
        Just(ChannelMethod::Open),
        Just(ChannelMethod::OpenOk),
        any::<bool>().prop_map(|active| ChannelMethod::Flow { active }),
        any::<bool>().prop_map(|active| ChannelMethod::FlowOk { active }),
        (any::<u16>(), arb_text(), any::<u16>(), any::<u16>()).prop_map(
            |(reply_code, reply_text, class_id, method_id)| ChannelMethod::Close {
                reply_code,
                reply_text,
                class_id,
                method_id,
            }
        ),
        Just(ChannelMethod::CloseOk),
    ]
}

fn arb_exchange_method() -> impl Strategy<Value = ExchangeMethod> {
    prop_oneof![
        (arb_name(), arb_name(), any::<[bool; 5]>(), arb_table()).prop_map(
            |(exchange, kind, [passive, durable, auto_delete, internal, no_wait], arguments)| {
                ExchangeMethod::Declare {
                    exchange,
                    kind,
                    passive,
                    durable,
                    auto_delete,
                    internal,
                    no_wait,
                    arguments,
                }
            }
        ),
        Just(ExchangeMethod::DeclareOk),
        (arb_name(), any::<bool>(), any::<bool>()).prop_map(|(exchange, if_unused, no_wait)| {
            ExchangeMethod::Delete { exchange, if_unused, no_wait }
        }),
        Just(ExchangeMethod::DeleteOk),
    ]
}

fn arb_queue_method() -> impl Strategy<Value = QueueMethod> {
    prop_oneof![
        (arb_name(), any::<[bool; 5]>(), arb_table()).prop_map(
            |(queue, [passive, durable, exclusive, auto_delete, no_wait], arguments)| {
                QueueMethod::Declare {
                    queue,
                    passive,
                    durable,
                    exclusive,
                    auto_delete,
                    no_wait,
                    arguments,
                }
            }
        ),
        (arb_name(), any::<u32>(), any::<u32>()).prop_map(
            |(queue, message_count, consumer_count)| QueueMethod::DeclareOk {
                queue,
                message_count,
                consumer_count
            }
        ),
        (arb_name(), arb_name(), arb_name(), any::<bool>(), arb_table()).prop_map(
            |(queue, exchange, routing_key, no_wait, arguments)| QueueMethod::Bind {
                queue,
                exchange,
                routing_key,
                no_wait,
                arguments,
            }
        ),
        Just(QueueMethod::BindOk),
        (arb_name(), any::<bool>()).prop_map(|(queue, no_wait)| QueueMethod::Purge {
            queue,
            no_wait
        }),
        any::<u32>().prop_map(|message_count| QueueMethod::PurgeOk { message_count }),
        (arb_name(), any::<[bool; 3]>()).prop_map(|(queue, [if_unused, if_empty, no_wait])| {
            QueueMethod::Delete { queue, if_unused, if_empty, no_wait }
        }),
        any::<u32>().prop_map(|message_count| QueueMethod::DeleteOk { message_count }),
        (arb_name(), arb_name(), arb_name(), arb_table()).prop_map(
            |(queue, exchange, routing_key, arguments)| QueueMethod::Unbind {
                queue,
                exchange,
                routing_key,
                arguments,
            }
        ),
        Just(QueueMethod::UnbindOk),
    ]
}

fn arb_basic_method() -> impl Strategy<Value = BasicMethod> {
    prop_oneof![
        (any::<u32>(), any::<u16>(), any::<bool>()).prop_map(
            |(prefetch_size, prefetch_count, global)| BasicMethod::Qos {
                prefetch_size,
                prefetch_count,
                global
            }
        ),
        Just(BasicMethod::QosOk),
        (arb_name(), arb_name(), any::<[bool; 4]>(), arb_table()).prop_map(
            |(queue, consumer_tag, [no_local, no_ack, exclusive, no_wait], arguments)| {
                BasicMethod::Consume {
                    queue,
                    consumer_tag,
                    no_local,
                    no_ack,
                    exclusive,
                    no_wait,
                    arguments,
                }
            }
        ),
        arb_name().prop_map(|consumer_tag| BasicMethod::ConsumeOk { consumer_tag }),
        (arb_name(), any::<bool>()).prop_map(|(consumer_tag, no_wait)| BasicMethod::Cancel {
            consumer_tag,
            no_wait
        }),
        arb_name().prop_map(|consumer_tag| BasicMethod::CancelOk { consumer_tag }),
        (arb_name(), arb_name(), any::<bool>(), any::<bool>()).prop_map(
            |(exchange, routing_key, mandatory, immediate)| BasicMethod::Publish {
                exchange,
                routing_key,
                mandatory,
                immediate,
            }
        ),
        (any::<u16>(), arb_text(), arb_name(), arb_name()).prop_map(
            |(reply_code, reply_text, exchange, routing_key)| BasicMethod::Return {
                reply_code,
                reply_text,
                exchange,
                routing_key,
            }
        ),
        (arb_name(), any::<u64>(), any::<bool>(), arb_name(), arb_name()).prop_map(
            |(consumer_tag, delivery_tag, redelivered, exchange, routing_key)| {
                BasicMethod::Deliver {
                    consumer_tag,
                    delivery_tag,
                    redelivered,
                    exchange,
                    routing_key,
                }
            }
        ),
        (arb_name(), any::<bool>()).prop_map(|(queue, no_ack)| BasicMethod::Get { queue, no_ack }),
        (any::<u64>(), any::<bool>(), arb_name(), arb_name(), any::<u32>()).prop_map(
            |(delivery_tag, redelivered, exchange, routing_key, message_count)| {
                BasicMethod::GetOk {
                    delivery_tag,
                    redelivered,
                    exchange,
                    routing_key,
                    message_count,
                }
            }
        ),
        Just(BasicMethod::GetEmpty),
        (any::<u64>(), any::<bool>()).prop_map(|(delivery_tag, multiple)| BasicMethod::Ack {
            delivery_tag,
            multiple
        }),
        (any::<u64>(), any::<bool>()).prop_map(|(delivery_tag, requeue)| BasicMethod::Reject {
            delivery_tag,
            requeue
        }),
        any::<bool>().prop_map(|requeue| BasicMethod::Recover { requeue }),
        Just(BasicMethod::RecoverOk),
        (any::<u64>(), any::<bool>(), any::<bool>()).prop_map(
            |(delivery_tag, multiple, requeue)| BasicMethod::Nack {
                delivery_tag,
                multiple,
                requeue
            }
        ),
    ]
}

fn arb_method() -> impl Strategy<Value = Method> {
    prop_oneof![
        arb_connection_method().prop_map(Method::Connection),
        arb_channel_method().prop_map(Method::Channel),
        arb_exchange_method().prop_map(Method::Exchange),
        arb_queue_method().prop_map(Method::Queue),
        arb_basic_method().prop_map(Method::Basic),
    ]
}

#[test]
fn prop_method_encode_decode_roundtrip() {
    proptest!(|(method in arb_method())| {
        let wire = method.encode().expect("encode should succeed");
        let decoded = Method::decode(&wire).expect("decode should succeed");
        prop_assert_eq!(decoded, method);
    });
}

#[test]
fn prop_class_and_method_ids_lead_the_payload() {
    proptest!(|(method in arb_method())| {
        let wire = method.encode().expect("encode should succeed");
        prop_assert!(wire.len() >= 4);
        let class_id = u16::from_be_bytes([wire[0], wire[1]]);
        let method_id = u16::from_be_bytes([wire[2], wire[3]]);
        prop_assert_eq!(class_id, method.class_id());
        prop_assert_eq!(method_id, method.method_id());
    });
}

#[test]
fn prop_field_table_roundtrip() {
    proptest!(|(table in arb_table())| {
        let mut enc = ottermq_proto::Encoder::new();
        table.encode(&mut enc);
        let wire = enc.finish();

        let mut dec = ottermq_proto::Decoder::new(&wire);
        let decoded = FieldTable::decode(&mut dec).expect("decode should succeed");
        prop_assert!(dec.is_empty());
        prop_assert_eq!(decoded, table);
    });
}
