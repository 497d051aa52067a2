use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use hickory_resolver::{ResolveError, TokioResolver};
use hickory_server::{
    authority::MessageResponseBuilder,
    proto::{
        op::{Header, MessageType, OpCode, ResponseCode},
        rr::{
            Name, RData, Record, RecordType,
            rdata::{A, AAAA},
        },
    },
    server::{Request, RequestHandler, ResponseHandler, ResponseInfo},
};
use metrics::counter;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, warn};

use crate::{
    host::{decode_alias_host, decode_host},
    lookup::InstanceLookup,
    telemetry::TELEMETRY_COUNTER_DNS_QUERIES,
};

const SYNTHESIZED_TTL: u32 = 10;

// Recursive resolution behind a seam so the responder logic is testable
// without a network.
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait Recursor: Send + Sync {
    async fn lookup_ip(&self, name: &str) -> Option<Vec<IpAddr>>;
}

pub(crate) struct SystemRecursor(TokioResolver);

impl SystemRecursor {
    pub(crate) fn new() -> Result<Self, ResolveError> {
        Ok(SystemRecursor(TokioResolver::builder_tokio()?.build()))
    }
}

#[async_trait]
impl Recursor for SystemRecursor {
    async fn lookup_ip(&self, name: &str) -> Option<Vec<IpAddr>> {
        match self.0.lookup_ip(name).await {
            Ok(lookup) => Some(lookup.iter().collect()),
            Err(_) => None,
        }
    }
}

// DNS responder that synthesizes answers for the hostname grammar and
// recurses for everything else. Names it cannot answer are dropped without
// a response; the querying resolver is expected to fall through.
pub(crate) struct NameResolver<L, R> {
    lookup: L,
    recursor: R,
}

impl<L: InstanceLookup, R: Recursor> NameResolver<L, R> {
    pub(crate) fn new(lookup: L, recursor: R) -> Self {
        NameResolver { lookup, recursor }
    }

    // Decide the answer set for one query name. None means drop.
    async fn plan(&self, name: &str, query_type: RecordType) -> Option<Vec<RData>> {
        let bare = name.trim_end_matches('.');
        if bare.eq_ignore_ascii_case("localhost") {
            return match query_type {
                RecordType::AAAA => Some(vec![RData::AAAA(AAAA::from(Ipv6Addr::LOCALHOST))]),
                _ => Some(vec![RData::A(A::from(Ipv4Addr::LOCALHOST))]),
            };
        }
        // Direct-form names carry their own answer; no lookup involved.
        if let Ok(identity) = decode_host(bare) {
            let address = identity.instance_address.parse::<Ipv4Addr>().ok()?;
            return Some(vec![RData::A(A::from(address))]);
        }
        if let Ok(identity) = decode_alias_host(bare) {
            let address = self
                .lookup
                .resolve_by_alias(&identity.alias, &identity.session_prefix)
                .await
                .ok()?;
            let address = address.parse::<Ipv4Addr>().ok()?;
            return Some(vec![RData::A(A::from(address))]);
        }
        let addresses = self.recursor.lookup_ip(name).await?;
        let records: Vec<RData> = addresses
            .into_iter()
            .filter(|address| match query_type {
                RecordType::A => address.is_ipv4(),
                RecordType::AAAA => address.is_ipv6(),
                _ => true,
            })
            .map(|address| match address {
                IpAddr::V4(v4) => RData::A(A::from(v4)),
                IpAddr::V6(v6) => RData::AAAA(AAAA::from(v6)),
            })
            .collect();
        if records.is_empty() {
            return None;
        }
        Some(records)
    }
}

#[async_trait]
impl<L, R> RequestHandler for NameResolver<L, R>
where
    L: InstanceLookup + Unpin + 'static,
    R: Recursor + Unpin + 'static,
{
    async fn handle_request<H: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: H,
    ) -> ResponseInfo {
        // Dropping a query means returning response info without sending.
        let dropped = || {
            let mut header = Header::response_from_request(request.header());
            header.set_response_code(ResponseCode::ServFail);
            header.into()
        };
        if request.message_type() != MessageType::Query || request.op_code() != OpCode::Query {
            return dropped();
        }
        let Ok(request_info) = request.request_info() else {
            return dropped();
        };
        let query = request_info.query;
        let name = query.name().to_string();
        let Some(answers) = self.plan(&name, query.query_type()).await else {
            debug!(%name, "Dropping DNS query without an answer.");
            return dropped();
        };
        counter!(TELEMETRY_COUNTER_DNS_QUERIES).increment(1);
        let record_name: Name = query.original().name().clone();
        let records: Vec<Record> = answers
            .into_iter()
            .map(|rdata| Record::from_rdata(record_name.clone(), SYNTHESIZED_TTL, rdata))
            .collect();
        let response = MessageResponseBuilder::from_message_request(request);
        let mut header = Header::response_from_request(request.header());
        header.set_authoritative(true);
        header.set_recursion_available(true);
        let message = response.build(header, records.iter(), &[], &[], &[]);
        match response_handle.send_response(message).await {
            Ok(info) => info,
            Err(error) => {
                warn!(%error, "Error sending DNS response.");
                dropped()
            }
        }
    }
}
