/// RDS endpoint classification
///
/// Recognises the DNS names RDS hands out for clusters, reader clusters,
/// custom clusters, proxies and instances, and derives the instance host
/// template and cluster id from them.
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::topology::HOST_TEMPLATE_PLACEHOLDER;

const DNS_WRITER_CLUSTER: &str = "cluster-";
const DNS_READER_CLUSTER: &str = "cluster-ro-";
const DNS_CUSTOM_CLUSTER: &str = "cluster-custom-";
const DNS_PROXY: &str = "proxy-";

lazy_static! {
    static ref RDS_DNS: Regex = Regex::new(
        r"(?i)^(?P<instance>.+)\.(?P<dns>proxy-|cluster-|cluster-ro-|cluster-custom-)?(?P<domain>[a-zA-Z0-9]+\.(?P<region>[a-zA-Z0-9\-]+)\.rds\.amazonaws\.com(?:\.cn)?)$"
    )
    .expect("Failed to compile RDS DNS pattern");
}

/// Kind of endpoint a connection was opened against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    /// `cluster-` endpoint, resolves to the writer
    RdsWriterCluster,
    /// `cluster-ro-` endpoint, resolves to a reader
    RdsReaderCluster,
    /// `cluster-custom-` endpoint
    RdsCustomCluster,
    /// `proxy-` endpoint
    RdsProxy,
    /// Direct instance endpoint
    RdsInstance,
    /// IPv4 or IPv6 literal
    IpAddress,
    /// Anything else; needs an explicit host pattern
    CustomDomain,
}

impl EndpointClass {
    pub fn is_rds_cluster(&self) -> bool {
        matches!(
            self,
            EndpointClass::RdsWriterCluster | EndpointClass::RdsReaderCluster | EndpointClass::RdsCustomCluster
        )
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndpointClass::RdsWriterCluster => "rds-writer-cluster",
            EndpointClass::RdsReaderCluster => "rds-reader-cluster",
            EndpointClass::RdsCustomCluster => "rds-custom-cluster",
            EndpointClass::RdsProxy => "rds-proxy",
            EndpointClass::RdsInstance => "rds-instance",
            EndpointClass::IpAddress => "ip-address",
            EndpointClass::CustomDomain => "custom-domain",
        };
        write!(f, "{}", name)
    }
}

fn captures(host: &str) -> Option<Captures<'_>> {
    RDS_DNS.captures(host)
}

fn dns_group(host: &str) -> Option<String> {
    captures(host)?.name("dns").map(|m| m.as_str().to_ascii_lowercase())
}

fn has_dns_group(host: &str, expected: &str) -> bool {
    dns_group(host).map_or(false, |dns| dns == expected)
}

pub fn is_rds_dns(host: &str) -> bool {
    RDS_DNS.is_match(host)
}

pub fn is_rds_cluster_dns(host: &str) -> bool {
    has_dns_group(host, DNS_WRITER_CLUSTER)
}

pub fn is_rds_reader_cluster_dns(host: &str) -> bool {
    has_dns_group(host, DNS_READER_CLUSTER)
}

pub fn is_rds_custom_cluster_dns(host: &str) -> bool {
    has_dns_group(host, DNS_CUSTOM_CLUSTER)
}

pub fn is_rds_proxy_dns(host: &str) -> bool {
    has_dns_group(host, DNS_PROXY)
}

pub fn is_ipv4(host: &str) -> bool {
    host.parse::<Ipv4Addr>().is_ok()
}

pub fn is_ipv6(host: &str) -> bool {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<Ipv6Addr>()
        .is_ok()
}

/// Instance host template, `?.<domain>`; `None` for non-RDS hosts
pub fn get_rds_instance_host_pattern(host: &str) -> Option<String> {
    let caps = captures(host)?;
    let domain = caps.name("domain")?.as_str();
    Some(format!("{}.{}", HOST_TEMPLATE_PLACEHOLDER, domain))
}

/// Writer cluster endpoint for a writer or reader cluster endpoint
pub fn get_rds_cluster_host_url(host: &str) -> Option<String> {
    let caps = captures(host)?;
    let dns = caps.name("dns")?.as_str().to_ascii_lowercase();
    if dns != DNS_WRITER_CLUSTER && dns != DNS_READER_CLUSTER {
        return None;
    }
    let instance = caps.name("instance")?.as_str();
    let domain = caps.name("domain")?.as_str();
    Some(format!("{}.{}{}", instance, DNS_WRITER_CLUSTER, domain))
}

/// Cluster name of a cluster or custom cluster endpoint
pub fn get_rds_cluster_id(host: &str) -> Option<String> {
    let caps = captures(host)?;
    let dns = caps.name("dns")?.as_str().to_ascii_lowercase();
    if dns == DNS_PROXY {
        return None;
    }
    caps.name("instance").map(|m| m.as_str().to_string())
}

pub fn classify_endpoint(host: &str) -> EndpointClass {
    if is_ipv4(host) || is_ipv6(host) {
        return EndpointClass::IpAddress;
    }
    if !is_rds_dns(host) {
        return EndpointClass::CustomDomain;
    }
    match dns_group(host).as_deref() {
        Some(DNS_WRITER_CLUSTER) => EndpointClass::RdsWriterCluster,
        Some(DNS_READER_CLUSTER) => EndpointClass::RdsReaderCluster,
        Some(DNS_CUSTOM_CLUSTER) => EndpointClass::RdsCustomCluster,
        Some(DNS_PROXY) => EndpointClass::RdsProxy,
        _ => EndpointClass::RdsInstance,
    }
}
