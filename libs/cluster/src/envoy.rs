//! Rendering of the Envoy bootstrap that splits mesh traffic.
//!
//! Requests carrying the routing header with the right tag go to the
//! workstation's shadow IP; everything else stays on the pod.

use crate::ROUTING_HEADER;

const BOOTSTRAP: &str = r#"static_resources:

  listeners:
    - name: listener_0
      address:
        socket_address:
          address: 0.0.0.0
          port_value: 10501
      filter_chains:
        - filters:
            - name: envoy.filters.network.http_connection_manager
              typed_config:
                "@type": type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager
                stat_prefix: ingress_http
                access_log:
                  - name: envoy.access_loggers.stdout
                    typed_config:
                      "@type": type.googleapis.com/envoy.extensions.access_loggers.stream.v3.StdoutAccessLog
                http_filters:
                  - name: envoy.filters.http.router
                route_config:
                  name: local_route
                  virtual_hosts:
                    - name: local_service
                      domains: ["*"]
                      routes:
                        - match:
                            headers:
                              - name: @@HEADER@@
                                exact_match: @@TAG@@
                            prefix: "/"
                          route:
                            cluster: service_debug_withHeader
                        - match:
                            prefix: "/"
                          route:
                            cluster: service_debug_withoutHeader

  clusters:
    - name: service_debug_withHeader
      type: LOGICAL_DNS
      dns_lookup_family: V4_ONLY
      load_assignment:
        cluster_name: service_debug_withHeader
        endpoints:
          - lb_endpoints:
              - endpoint:
                  address:
                    socket_address:
                      address: @@SHADOW_IP@@
                      port_value: @@PORT@@
    - name: service_debug_withoutHeader
      type: LOGICAL_DNS
      dns_lookup_family: V4_ONLY
      load_assignment:
        cluster_name: service_debug_withoutHeader
        endpoints:
          - lb_endpoints:
              - endpoint:
                  address:
                    socket_address:
                      address: 127.0.0.1
                      port_value: @@PORT@@
"#;

/// Renders the bootstrap: header-tagged requests to `shadow_ip`, the rest
/// back to the pod on `port`.
pub fn bootstrap(tag: &str, shadow_ip: &str, port: &str) -> String {
    BOOTSTRAP
        .replace("@@HEADER@@", ROUTING_HEADER)
        .replace("@@TAG@@", tag)
        .replace("@@SHADOW_IP@@", shadow_ip)
        .replace("@@PORT@@", port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_matches_the_routing_tag() {
        let rendered = bootstrap("dev", "223.254.254.7", "9080");

        assert!(rendered.contains("name: KubeVPN-Routing-Tag"));
        assert!(rendered.contains("exact_match: dev"));
        assert!(rendered.contains("address: 223.254.254.7"));
        assert!(rendered.contains("port_value: 9080"));
        // The default route still points back at the pod.
        assert!(rendered.contains("address: 127.0.0.1"));
    }
}
