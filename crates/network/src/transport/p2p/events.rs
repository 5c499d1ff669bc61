use libp2p::swarm::SwarmEvent;
use libp2p::{identify, kad, mdns, ping};
use owo_colors::OwoColorize;
use tracing::{debug, info, trace};

use super::{BehaviourEvent, EventLoop};

trait EventHandler<E> {
    fn handle(&mut self, event: E);
}

impl EventLoop {
    pub(super) fn handle_swarm_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(event) => match event {
                BehaviourEvent::Identify(event) => self.handle(event),
                BehaviourEvent::Kad(event) => self.handle(event),
                BehaviourEvent::Mdns(event) => self.handle(event),
                BehaviourEvent::Ping(event) => self.handle(event),
                BehaviourEvent::Stream(()) => {}
            },
            SwarmEvent::NewListenAddr { address, .. } => {
                let local_peer_id = *self.swarm.local_peer_id();

                info!(%local_peer_id, %address, "Listening");
            }
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                debug!(%peer_id, ?endpoint, "Connection established");
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                endpoint,
                cause,
                ..
            } => {
                debug!(%peer_id, ?endpoint, ?cause, "Connection closed");
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                debug!(?peer_id, %error, "Outgoing connection error");
            }
            SwarmEvent::IncomingConnectionError {
                send_back_addr,
                error,
                ..
            } => {
                debug!(%send_back_addr, %error, "Incoming connection error");
            }
            event => trace!(?event, "Unhandled swarm event"),
        }
    }
}

impl EventHandler<identify::Event> for EventLoop {
    fn handle(&mut self, event: identify::Event) {
        debug!("{}: {:?}", "identify".yellow(), event);

        if let identify::Event::Received { peer_id, info, .. } = event {
            for addr in info.listen_addrs {
                let _ignored = self.swarm.behaviour_mut().kad.add_address(&peer_id, addr);
            }
        }
    }
}

impl EventHandler<kad::Event> for EventLoop {
    fn handle(&mut self, event: kad::Event) {
        debug!("{}: {:?}", "kad".yellow(), event);
    }
}

impl EventHandler<mdns::Event> for EventLoop {
    fn handle(&mut self, event: mdns::Event) {
        debug!("{}: {:?}", "mdns".yellow(), event);

        match event {
            mdns::Event::Discovered(peers) => {
                for (peer_id, addr) in peers {
                    debug!("Discovered {} at {}", peer_id, addr);

                    let _ignored = self.swarm.behaviour_mut().kad.add_address(&peer_id, addr);
                }
            }
            mdns::Event::Expired(peers) => {
                for (peer_id, addr) in peers {
                    debug!("Expired {} at {}", peer_id, addr);

                    drop(
                        self.swarm
                            .behaviour_mut()
                            .kad
                            .remove_address(&peer_id, &addr),
                    );
                }
            }
        }
    }
}

impl EventHandler<ping::Event> for EventLoop {
    fn handle(&mut self, event: ping::Event) {
        trace!("{}: {:?}", "ping".yellow(), event);
    }
}
