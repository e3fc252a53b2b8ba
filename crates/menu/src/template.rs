//! iPXE menu script rendering.

use std::net::Ipv4Addr;

use minijinja::{context, Environment};

/// The boot menu served to our chainloaded iPXE.
///
/// When an upstream proxyDHCP already pointed the client somewhere, those
/// settings are kept; otherwise the client lands on the role menu and chains
/// into the HTTP boot-configuration endpoint with its identity in the query
/// string.
const MENU_TEMPLATE: &str = r#"#!ipxe
isset ${proxydhcp/next-server} || goto start
set next-server ${proxydhcp/next-server}
set filename ${proxydhcp/filename}

:start
menu iPXE boot menu
item --gap                      Nodes
item --key i init               Bootstrap Node
item --key c controlplane       Master Node
item --key w worker             Worker Node
item --gap                      Other
item --key s shell              iPXE Shell
item --key r reboot             Reboot
item --key e exit               Exit
choose --timeout 0 --default worker selected || goto cancel
set menu-timeout 0
goto ${selected}

:init
chain http://{{ ip }}:{{ port }}/ipxe?uuid=${uuid}&mac=${mac:hexhyp}&domain=${domain}&hostname=${hostname}&serial=${serial}&type=init

:controlplane
chain http://{{ ip }}:{{ port }}/ipxe?uuid=${uuid}&mac=${mac:hexhyp}&domain=${domain}&hostname=${hostname}&serial=${serial}&type=controlplane

:worker
chain http://{{ ip }}:{{ port }}/ipxe?uuid=${uuid}&mac=${mac:hexhyp}&domain=${domain}&hostname=${hostname}&serial=${serial}&type=worker

:reboot
reboot

:shell
shell

:exit
exit
"#;

#[derive(Debug, thiserror::Error)]
pub enum MenuError {
    #[error("menu template error")]
    Template(#[from] minijinja::Error),
}

/// Renders the boot menu. The template compiles once at construction, so a
/// broken template fails startup instead of the first client.
pub struct MenuEngine {
    env: Environment<'static>,
    server_ip: Ipv4Addr,
    http_port: u16,
}

impl MenuEngine {
    pub fn new(server_ip: Ipv4Addr, http_port: u16) -> Result<Self, MenuError> {
        Self::from_source(MENU_TEMPLATE, server_ip, http_port)
    }

    fn from_source(
        source: &'static str,
        server_ip: Ipv4Addr,
        http_port: u16,
    ) -> Result<Self, MenuError> {
        let mut env = Environment::new();
        env.add_template("menu", source)?;
        Ok(MenuEngine {
            env,
            server_ip,
            http_port,
        })
    }

    pub fn render(&self) -> Result<String, MenuError> {
        let template = self.env.get_template("menu")?;
        let rendered = template.render(context! {
            ip => self.server_ip.to_string(),
            port => self.http_port,
        })?;
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_chain_urls_and_roles() {
        let engine = MenuEngine::new(Ipv4Addr::new(10, 5, 0, 2), 8080).unwrap();
        let script = engine.render().unwrap();

        assert!(script.starts_with("#!ipxe\n"));
        assert!(script.contains("isset ${proxydhcp/next-server} || goto start"));
        assert!(script.contains("choose --timeout 0 --default worker selected"));
        for role in ["init", "controlplane", "worker"] {
            assert!(script.contains(&format!(
                "chain http://10.5.0.2:8080/ipxe?uuid=${{uuid}}&mac=${{mac:hexhyp}}&domain=${{domain}}&hostname=${{hostname}}&serial=${{serial}}&type={role}"
            )));
        }
        // iPXE variables must survive rendering untouched.
        assert!(script.contains("${proxydhcp/filename}"));
    }

    #[test]
    fn malformed_template_fails_construction() {
        let result = MenuEngine::from_source("{{ unclosed", Ipv4Addr::LOCALHOST, 8080);
        assert!(matches!(result, Err(MenuError::Template(_))));
    }
}
