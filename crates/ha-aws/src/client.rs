//! EC2 Query API client.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use ha_common::Ipv4Net;

use crate::error::AwsError;
use crate::imds::{Credentials, ImdsClient};
use crate::sigv4;
use crate::CloudClient;

const API_VERSION: &str = "2016-11-15";

/// Tight connect timeout: the endpoint is expected in-VPC, and a stuck
/// call holds up a go-active worker.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// An EC2 API failure, before classification into [`AwsError`].
///
/// Kept internal so callers that need the provider error code (the
/// replace-route fallback) can branch on it exactly.
#[derive(Debug)]
enum QueryError {
    Api {
        status: u16,
        code: String,
        message: String,
    },
    Http(reqwest::Error),
}

impl From<QueryError> for AwsError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::Api {
                status,
                code,
                message,
            } => AwsError::from_api_error(status, &code, &message),
            QueryError::Http(err) => err.into(),
        }
    }
}

/// A parsed route-table entry, restricted to the fields this app compares.
#[derive(Debug, PartialEq, Eq)]
struct RouteEntry {
    destination: Option<Ipv4Net>,
    network_interface_id: Option<String>,
}

/// Client for the EC2 operations backing configured actions.
pub struct Ec2Client {
    http: reqwest::Client,
    endpoint: reqwest::Url,
    host: String,
    region: String,
    instance_id: String,
    credentials: Credentials,
    enis_by_index: HashMap<u32, String>,
}

impl Ec2Client {
    /// Initialize the client against the given endpoint URL.
    ///
    /// Performs the IMDSv2 identity handshake and loads the local
    /// instance's device-index to ENI attachment map (assumed static for
    /// the process lifetime). Any failure here is fatal to startup.
    pub async fn new(endpoint_url: &str) -> Result<Self, AwsError> {
        let identity = ImdsClient::new()?.identity().await?;
        debug!(
            instance_id = %identity.instance_id,
            region = %identity.region,
            "Creating AWS EC2 client"
        );

        let endpoint = reqwest::Url::parse(endpoint_url)
            .map_err(|err| AwsError::Permanent(format!("invalid EC2 endpoint URL: {err}")))?;
        let host = match (endpoint.host_str(), endpoint.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(AwsError::Permanent(format!(
                    "EC2 endpoint URL {endpoint_url:?} has no host"
                )))
            }
        };
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        let mut client = Self {
            http,
            endpoint,
            host,
            region: identity.region,
            instance_id: identity.instance_id,
            credentials: identity.credentials,
            enis_by_index: HashMap::new(),
        };
        client.enis_by_index = client.load_instance_enis().await?;
        info!(
            instance_id = %client.instance_id,
            region = %client.region,
            enis = client.enis_by_index.len(),
            "EC2 client ready"
        );
        Ok(client)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Fetch the local instance's ENI attachments.
    async fn load_instance_enis(&self) -> Result<HashMap<u32, String>, AwsError> {
        let xml = self
            .query(
                "DescribeInstances",
                &[("InstanceId.1", self.instance_id.clone())],
            )
            .await?;
        let enis = parse_instance_enis(&xml)?;
        if enis.is_empty() {
            return Err(AwsError::NotFound(format!(
                "EC2 instance {} has no network interface attachments",
                self.instance_id
            )));
        }
        Ok(enis)
    }

    /// Secondary (and primary) private IPv4 addresses on an ENI.
    async fn private_ips(&self, eni_id: &str) -> Result<HashSet<Ipv4Addr>, AwsError> {
        let xml = self
            .query(
                "DescribeNetworkInterfaces",
                &[("NetworkInterfaceId.1", eni_id.to_string())],
            )
            .await?;
        Ok(parse_private_ips(&xml)?)
    }

    /// The routes of a route table.
    async fn routes(&self, route_table_id: &str) -> Result<Vec<RouteEntry>, AwsError> {
        let xml = self
            .query(
                "DescribeRouteTables",
                &[("RouteTableId.1", route_table_id.to_string())],
            )
            .await?;
        Ok(parse_route_tables(&xml)?)
    }

    async fn query(&self, action: &str, params: &[(&str, String)]) -> Result<String, AwsError> {
        Ok(self.query_raw(action, params).await?)
    }

    /// Issue one signed Query API call.
    async fn query_raw(
        &self,
        action: &str,
        params: &[(&str, String)],
    ) -> Result<String, QueryError> {
        let mut pairs: Vec<(&str, &str)> = vec![("Action", action), ("Version", API_VERSION)];
        pairs.extend(params.iter().map(|(k, v)| (*k, v.as_str())));
        let body = form_urlencode(&pairs);

        let signature = sigv4::sign_query_request(
            &self.credentials,
            &self.region,
            &self.host,
            body.as_bytes(),
            Utc::now(),
        );

        let mut request = self
            .http
            .post(self.endpoint.clone())
            .header("content-type", sigv4::CONTENT_TYPE)
            .header("x-amz-date", &signature.amz_date)
            .header("authorization", &signature.authorization);
        if let Some(token) = &signature.security_token {
            request = request.header("x-amz-security-token", token);
        }

        let response = request.body(body).send().await.map_err(QueryError::Http)?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(QueryError::Http)?;
        if (200..300).contains(&status) {
            Ok(text)
        } else {
            let (code, message) = parse_api_error(&text);
            debug!(action, status, code = %code, "EC2 API error response");
            Err(QueryError::Api {
                status,
                code,
                message,
            })
        }
    }
}

#[async_trait]
impl CloudClient for Ec2Client {
    fn indexed_eni(&self, device_index: u32) -> Result<String, AwsError> {
        self.enis_by_index
            .get(&device_index)
            .cloned()
            .ok_or_else(|| {
                AwsError::NotFound(format!(
                    "EC2 instance {} device index '{}' not found",
                    self.instance_id, device_index
                ))
            })
    }

    async fn validate_route_table(&self, route_table_id: &str) -> Result<(), AwsError> {
        self.routes(route_table_id).await.map(drop)
    }

    async fn validate_network_interface(&self, eni_id: &str) -> Result<(), AwsError> {
        self.private_ips(eni_id).await.map(drop)
    }

    async fn assign_vip(
        &self,
        device_index: u32,
        vip: Ipv4Addr,
        precheck: bool,
    ) -> Result<(), AwsError> {
        let eni_id = self.indexed_eni(device_index)?;
        if precheck {
            if self.private_ips(&eni_id).await?.contains(&vip) {
                debug!(vip = %vip, "IPv4 address already assigned");
                return Ok(());
            }
            debug!(vip = %vip, "IPv4 address not assigned at precheck");
        }

        info!(
            vip = %vip,
            device_index,
            eni = %eni_id,
            "Assigning private IPv4 address"
        );
        self.query(
            "AssignPrivateIpAddresses",
            &[
                ("NetworkInterfaceId", eni_id),
                ("PrivateIpAddress.1", vip.to_string()),
                ("AllowReassignment", "true".to_string()),
            ],
        )
        .await
        .map(drop)
    }

    async fn update_route_table(
        &self,
        route_table_id: &str,
        destination: Ipv4Net,
        target_network_interface: &str,
        precheck: bool,
    ) -> Result<(), AwsError> {
        if precheck {
            let present = self.routes(route_table_id).await?.iter().any(|route| {
                route.destination == Some(destination)
                    && route.network_interface_id.as_deref() == Some(target_network_interface)
            });
            if present {
                debug!(
                    destination = %destination,
                    target = %target_network_interface,
                    route_table = %route_table_id,
                    "Route already present in route table"
                );
                return Ok(());
            }
            debug!(
                destination = %destination,
                target = %target_network_interface,
                route_table = %route_table_id,
                "Route not present in route table at precheck"
            );
        }

        info!(
            route_table = %route_table_id,
            destination = %destination,
            target = %target_network_interface,
            "Updating route table"
        );
        let params = [
            ("RouteTableId", route_table_id.to_string()),
            ("DestinationCidrBlock", destination.to_string()),
            ("NetworkInterfaceId", target_network_interface.to_string()),
        ];
        match self.query_raw("ReplaceRoute", &params).await {
            Ok(_) => Ok(()),
            Err(QueryError::Api { code, .. })
                if code == "InvalidRoute.NotFound" || code == "InvalidParameterValue" =>
            {
                // The route does not exist yet; create it. This fallback
                // is the only retry the adapter performs.
                info!(
                    route_table = %route_table_id,
                    destination = %destination,
                    target = %target_network_interface,
                    "Creating route in route table"
                );
                match self.query_raw("CreateRoute", &params).await {
                    Ok(_) => Ok(()),
                    Err(QueryError::Api { code, .. }) if code == "RouteAlreadyExists" => {
                        // Two dispatches raced into creating the route;
                        // not an error, just replace again.
                        info!(
                            route_table = %route_table_id,
                            destination = %destination,
                            "Route already created, trying again to update"
                        );
                        self.query_raw("ReplaceRoute", &params).await.map(drop)?;
                        Ok(())
                    }
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Form-encode key/value pairs the way the Query API expects:
/// RFC 3986 unreserved characters kept literal, everything else
/// percent-encoded, including the `/` in CIDR destinations.
fn form_urlencode(pairs: &[(&str, &str)]) -> String {
    fn encode_into(out: &mut String, s: &str) {
        for b in s.bytes() {
            match b {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    out.push(b as char)
                }
                _ => {
                    out.push('%');
                    out.push_str(&format!("{b:02X}"));
                }
            }
        }
    }

    let mut out = String::new();
    for (i, (key, value)) in pairs.iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        encode_into(&mut out, key);
        out.push('=');
        encode_into(&mut out, value);
    }
    out
}

fn child_text<'a>(node: roxmltree::Node<'a, 'a>, name: &str) -> Option<&'a str> {
    node.children()
        .find(|child| child.tag_name().name() == name)
        .and_then(|child| child.text())
}

fn parse_xml(xml: &str) -> Result<roxmltree::Document<'_>, AwsError> {
    roxmltree::Document::parse(xml)
        .map_err(|err| AwsError::Permanent(format!("malformed EC2 API response: {err}")))
}

/// Device-index to ENI-id attachment map from a DescribeInstances response.
fn parse_instance_enis(xml: &str) -> Result<HashMap<u32, String>, AwsError> {
    let doc = parse_xml(xml)?;
    let mut enis = HashMap::new();
    for set in doc
        .descendants()
        .filter(|n| n.tag_name().name() == "networkInterfaceSet")
    {
        for item in set.children().filter(|n| n.tag_name().name() == "item") {
            let Some(eni_id) = child_text(item, "networkInterfaceId") else {
                continue;
            };
            let device_index = item
                .children()
                .find(|n| n.tag_name().name() == "attachment")
                .and_then(|attachment| child_text(attachment, "deviceIndex"))
                .and_then(|text| text.parse::<u32>().ok());
            if let Some(device_index) = device_index {
                enis.insert(device_index, eni_id.to_string());
            }
        }
    }
    Ok(enis)
}

/// Private IPv4 addresses from a DescribeNetworkInterfaces response.
fn parse_private_ips(xml: &str) -> Result<HashSet<Ipv4Addr>, AwsError> {
    let doc = parse_xml(xml)?;
    Ok(doc
        .descendants()
        .filter(|n| n.tag_name().name() == "privateIpAddress")
        .filter_map(|n| n.text())
        .filter_map(|text| text.parse().ok())
        .collect())
}

/// Route entries from a DescribeRouteTables response.
fn parse_route_tables(xml: &str) -> Result<Vec<RouteEntry>, AwsError> {
    let doc = parse_xml(xml)?;
    let mut routes = Vec::new();
    for set in doc
        .descendants()
        .filter(|n| n.tag_name().name() == "routeSet")
    {
        for item in set.children().filter(|n| n.tag_name().name() == "item") {
            routes.push(RouteEntry {
                destination: child_text(item, "destinationCidrBlock")
                    .and_then(|text| text.parse().ok()),
                network_interface_id: child_text(item, "networkInterfaceId")
                    .map(str::to_string),
            });
        }
    }
    Ok(routes)
}

/// Error code and message from an EC2 API error response body.
fn parse_api_error(xml: &str) -> (String, String) {
    let Ok(doc) = roxmltree::Document::parse(xml) else {
        return ("Unknown".to_string(), xml.trim().to_string());
    };
    let error = doc
        .descendants()
        .find(|n| n.tag_name().name() == "Error");
    match error {
        Some(error) => (
            child_text(error, "Code").unwrap_or("Unknown").to_string(),
            child_text(error, "Message").unwrap_or("").to_string(),
        ),
        None => ("Unknown".to_string(), xml.trim().to_string()),
    }
}
