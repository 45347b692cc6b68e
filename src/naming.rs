//! Naming-service interface.
//!
//! Real backends (DNS, Consul, ZooKeeper, ...) live outside this repo and
//! implement [NamingService]; the in-tree [ListNamingService] resolves a
//! fixed `"host:port,host:port"` list, which is enough for tests and static
//! deployments.

use polyrpc_core::error::RpcError;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Registration payload for backends that support announcement.
#[derive(Debug, Clone)]
pub struct RegisterInfo {
    pub service_name: String,
    pub endpoint: Endpoint,
}

/// Watches endpoint changes for a subscribed query.
pub trait NamingListener: Send + Sync {
    fn on_change(&self, endpoints: &[Endpoint]);
}

pub trait NamingService: Send + Sync {
    fn lookup(&self, query: &str) -> Result<Vec<Endpoint>, RpcError>;

    fn subscribe(&self, query: &str, listener: Box<dyn NamingListener>) -> Result<(), RpcError>;

    fn unsubscribe(&self, query: &str) -> Result<(), RpcError>;

    fn register(&self, info: &RegisterInfo) -> Result<(), RpcError>;

    fn unregister(&self, info: &RegisterInfo) -> Result<(), RpcError>;

    fn destroy(&self);
}

/// Fixed list backend: the query itself is the endpoint list.
pub struct ListNamingService;

impl ListNamingService {
    fn parse(query: &str) -> Result<Vec<Endpoint>, RpcError> {
        let mut out = Vec::new();
        for part in query.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (host, port) = part.rsplit_once(':').ok_or_else(|| {
                RpcError::network(format!("endpoint {:?} is not host:port", part))
            })?;
            let port = port
                .parse::<u16>()
                .map_err(|_| RpcError::network(format!("bad port in {:?}", part)))?;
            out.push(Endpoint { host: host.to_string(), port });
        }
        if out.is_empty() {
            return Err(RpcError::network(format!("empty endpoint list {:?}", query)));
        }
        Ok(out)
    }
}

impl NamingService for ListNamingService {
    fn lookup(&self, query: &str) -> Result<Vec<Endpoint>, RpcError> {
        Self::parse(query)
    }

    fn subscribe(&self, query: &str, listener: Box<dyn NamingListener>) -> Result<(), RpcError> {
        // a static list never changes; deliver the one snapshot
        listener.on_change(&Self::parse(query)?);
        Ok(())
    }

    fn unsubscribe(&self, _query: &str) -> Result<(), RpcError> {
        Ok(())
    }

    fn register(&self, info: &RegisterInfo) -> Result<(), RpcError> {
        debug!("list naming ignores register of {}", info.endpoint);
        Ok(())
    }

    fn unregister(&self, info: &RegisterInfo) -> Result<(), RpcError> {
        debug!("list naming ignores unregister of {}", info.endpoint);
        Ok(())
    }

    fn destroy(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_lookup() {
        let naming = ListNamingService;
        let endpoints = naming.lookup("10.0.0.1:8000, 10.0.0.2:8001").expect("lookup");
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].to_string(), "10.0.0.1:8000");
        assert!(naming.lookup("").is_err());
        assert!(naming.lookup("nocolon").is_err());
        assert!(naming.lookup("host:notaport").is_err());
    }
}
