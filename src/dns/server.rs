//! 内置 DNS 服务（UDP + TCP）。
//!
//! 请求经过中间件链：fake-ip 合成 → 反向映射记录 → 解析器。
//! 应答统一置 Response + RecursionAvailable；内部错误以 SERVFAIL
//! 返回并保留 Questions。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::resolver::{empty_reply, message_ips};
use super::{HostMapper, Resolver};

/// fake-ip 应答的 TTL：流量真正出站前映射必须还在
const FAKE_TTL: u32 = 1;
/// redir-host 反向映射条目的保底 TTL
const MAPPING_MIN_TTL: u64 = 60;

/// 请求处理器：中间件链的载体
pub struct ServerHandler {
    resolver: Arc<Resolver>,
    mapper: Arc<HostMapper>,
}

impl ServerHandler {
    pub fn new(resolver: Arc<Resolver>, mapper: Arc<HostMapper>) -> Arc<Self> {
        Arc::new(Self { resolver, mapper })
    }

    /// 处理一个请求；任何内部错误都折叠成 SERVFAIL
    pub async fn handle(&self, msg: &Message) -> Message {
        match self.handle_inner(msg).await {
            Ok(mut reply) => {
                reply.set_id(msg.id());
                reply.set_message_type(MessageType::Response);
                reply.set_recursion_available(true);
                reply
            }
            Err(e) => {
                debug!(error = %e, "dns request failed");
                let mut reply = Message::new();
                reply.set_id(msg.id());
                reply.set_message_type(MessageType::Response);
                reply.set_recursion_available(true);
                reply.set_response_code(ResponseCode::ServFail);
                for q in msg.queries() {
                    reply.add_query(q.clone());
                }
                reply
            }
        }
    }

    async fn handle_inner(&self, msg: &Message) -> Result<Message> {
        let query = msg
            .queries()
            .first()
            .ok_or_else(|| anyhow::anyhow!("request has no question"))?;
        let host = query.name().to_ascii();
        let host = host.trim_end_matches('.').to_string();

        // --- fake-ip 中间件 ---
        if self.mapper.fake_ip_enabled() {
            if let Some(pool) = self.mapper.fake_pool() {
                if !pool.is_filtered(&host) {
                    match query.query_type() {
                        RecordType::A => {
                            let ip = pool.lookup(&host);
                            let mut reply = empty_reply(msg);
                            reply.add_answer(Record::from_rdata(
                                query.name().clone(),
                                FAKE_TTL,
                                RData::A(A(ip)),
                            ));
                            debug!(host = host.as_str(), ip = %ip, "fake-ip answered");
                            return Ok(reply);
                        }
                        // 可合成域名的 AAAA / HTTPS / SVCB：空答成功，
                        // 逼客户端用 A 记录走 fake-ip
                        RecordType::AAAA | RecordType::HTTPS | RecordType::SVCB => {
                            return Ok(empty_reply(msg));
                        }
                        _ => {}
                    }
                }
            }
        }

        let reply = self.resolver.exchange(msg).await?;

        // --- 反向映射记录中间件（redir-host） ---
        if self.mapper.mapping_enabled() && !self.mapper.fake_ip_enabled() {
            let ttl = reply
                .answers()
                .iter()
                .map(|r| r.ttl() as u64)
                .min()
                .unwrap_or(MAPPING_MIN_TTL)
                .max(MAPPING_MIN_TTL);
            for ip in message_ips(&reply) {
                self.mapper.record(ip, &host, Duration::from_secs(ttl));
            }
        }

        Ok(reply)
    }
}

/// 运行中的 DNS 服务；Drop 即停
pub struct DnsServer {
    addr: SocketAddr,
    udp_task: JoinHandle<()>,
    tcp_task: JoinHandle<()>,
}

impl DnsServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for DnsServer {
    fn drop(&mut self) {
        self.udp_task.abort();
        self.tcp_task.abort();
    }
}

/// 在地址上同时监听 UDP 与 TCP
pub async fn serve(addr: &str, handler: Arc<ServerHandler>) -> Result<DnsServer> {
    let udp = UdpSocket::bind(addr).await?;
    let local = udp.local_addr()?;
    let tcp = TcpListener::bind(local).await?;

    info!(listen = %local, "dns server started");

    let udp = Arc::new(udp);
    let udp_handler = handler.clone();
    let udp_task = tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let (n, from) = match udp.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "dns udp recv failed");
                    continue;
                }
            };
            let msg = match Message::from_vec(&buf[..n]) {
                Ok(msg) => msg,
                Err(_) => continue,
            };
            let handler = udp_handler.clone();
            let udp = udp.clone();
            tokio::spawn(async move {
                let reply = handler.handle(&msg).await;
                if let Ok(wire) = reply.to_vec() {
                    let _ = udp.send_to(&wire, from).await;
                }
            });
        }
    });

    let tcp_handler = handler.clone();
    let tcp_task = tokio::spawn(async move {
        loop {
            let (mut stream, _) = match tcp.accept().await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "dns tcp accept failed");
                    continue;
                }
            };
            let handler = tcp_handler.clone();
            tokio::spawn(async move {
                // 同一连接上可以串行跑多个查询
                loop {
                    let len = match stream.read_u16().await {
                        Ok(len) => len as usize,
                        Err(_) => break,
                    };
                    let mut buf = vec![0u8; len];
                    if stream.read_exact(&mut buf).await.is_err() {
                        break;
                    }
                    let Ok(msg) = Message::from_vec(&buf) else {
                        break;
                    };
                    let reply = handler.handle(&msg).await;
                    let Ok(wire) = reply.to_vec() else { break };
                    if stream
                        .write_all(&(wire.len() as u16).to_be_bytes())
                        .await
                        .is_err()
                        || stream.write_all(&wire).await.is_err()
                    {
                        break;
                    }
                }
            });
        }
    });

    Ok(DnsServer {
        addr: local,
        udp_task,
        tcp_task,
    })
}
