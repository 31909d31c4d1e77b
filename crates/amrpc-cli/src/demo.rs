// Copyright 2025 AMRPC Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Demo endpoints served by `amrpc serve`.

use amrpc_common::Result;
use amrpc_server::{Call, HandlerError, Server};
use serde_json::{json, Value};

/// Registers `ping`, `echo` and `divide` on `server`.
pub fn register_demo_endpoints(server: &mut Server) -> Result<()> {
    server
        .register_endpoint("ping", ping)?
        .register_endpoint("echo", echo)?
        .register_endpoint("divide", divide)?;
    Ok(())
}

async fn ping(_call: Call) -> std::result::Result<&'static str, HandlerError> {
    Ok("pong")
}

async fn echo(call: Call) -> std::result::Result<Value, HandlerError> {
    Ok(json!({ "args": call.args, "kwargs": call.kwargs }))
}

async fn divide(call: Call) -> std::result::Result<f64, HandlerError> {
    let dividend: f64 = call.arg(0)?;
    let divisor: f64 = call.arg(1)?;
    if divisor == 0.0 {
        return Err(HandlerError::failed("division by zero"));
    }
    Ok(dividend / divisor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use amrpc_common::transport::MemoryBroker;
    use amrpc_common::{Envelope, ServiceConfig};
    use amrpc_server::ServerConfig;

    fn call(key: &str, envelope: Envelope) -> Call {
        Call::new(key, envelope)
    }

    #[tokio::test]
    async fn test_demo_handlers() {
        assert_eq!(ping(call("am.ping", Envelope::new())).await, Ok("pong"));

        let echoed = echo(call("am.echo", Envelope::new().arg(1).kwarg("k", "v")))
            .await
            .unwrap();
        assert_eq!(echoed, json!({"args": [1], "kwargs": {"k": "v"}}));

        assert_eq!(
            divide(call("am.divide", Envelope::new().arg(10).arg(4))).await,
            Ok(2.5)
        );
        assert_eq!(
            divide(call("am.divide", Envelope::new().arg(1).arg(0))).await,
            Err(HandlerError::failed("division by zero"))
        );
    }

    #[test]
    fn test_register_demo_endpoints() {
        let broker = MemoryBroker::new();
        let config = ServerConfig::new(ServiceConfig::new("am", "demo"));
        let mut server = Server::new(config, broker.connector()).unwrap();
        register_demo_endpoints(&mut server).unwrap();
        assert_eq!(
            server.registry().binding_keys(),
            vec!["am.demo.ping", "am.demo.echo", "am.demo.divide"]
        );
    }
}
