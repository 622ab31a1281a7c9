// BSD 3-Clause License
// Copyright (c) 2026, Virtual Cable S.L.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice,
//    this list of conditions and the following disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice,
//    this list of conditions and the following disclaimer in the documentation
//    and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors
//    may be used to endorse or promote products derived from this software
//    without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS"
// AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
// IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE
// FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
// DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER
// CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY,
// OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

// Authors: Adolfo Gómez, dkmaster at dkmon dot com

use anyhow::{Result, anyhow, ensure};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::AsyncReadExt;

// https://github.com/haproxy/haproxy/blob/master/doc/proxy-protocol.txt

use super::consts::{PROXY_V1_MAX_LINE, PROXY_V1_SIGNATURE, PROXY_V2_SIGNATURE};

/// Addresses recovered from a PROXY protocol v1 or v2 preamble. The version
/// is sniffed from the first six bytes, so both can sit in front of the same
/// listener.
#[derive(Debug)]
pub struct ProxyHeader {
    pub source_addr: SocketAddr,
    pub dest_addr: SocketAddr,
}

impl ProxyHeader {
    pub async fn read_from_stream<R>(stream: &mut R) -> Result<ProxyHeader>
    where
        R: AsyncReadExt + Unpin,
    {
        let mut sniff = [0u8; 6];
        stream.read_exact(&mut sniff).await?;

        if sniff == *PROXY_V1_SIGNATURE {
            return ProxyHeader::read_v1_line(stream).await;
        }

        let mut header_buf = [0u8; 16];
        header_buf[..6].copy_from_slice(&sniff);
        stream.read_exact(&mut header_buf[6..]).await?;

        ensure!(
            header_buf[..12] == PROXY_V2_SIGNATURE,
            "invalid PROXY signature"
        );

        let ver_cmd = header_buf[12];
        let len = u16::from_be_bytes([header_buf[14], header_buf[15]]) as usize;

        ensure!((ver_cmd >> 4) == 0x2, "not PROXY protocol v2");
        ensure!(
            (ver_cmd & 0x0F) == 0x1,
            "unsupported PROXY command (only PROXY=1 allowed)"
        );

        let mut addr_data = vec![0u8; len];
        stream.read_exact(&mut addr_data).await?;

        ProxyHeader::parse_v2(header_buf[13], &addr_data)
    }

    // The line form: "PROXY TCP4 <src> <dst> <srcport> <dstport>\r\n".
    // Read byte by byte so nothing of the request behind it is consumed.
    async fn read_v1_line<R>(stream: &mut R) -> Result<ProxyHeader>
    where
        R: AsyncReadExt + Unpin,
    {
        let mut line = Vec::with_capacity(64);
        let mut byte = [0u8; 1];
        loop {
            stream.read_exact(&mut byte).await?;
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
            ensure!(line.len() <= PROXY_V1_MAX_LINE, "PROXY v1 line too long");
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        let line = std::str::from_utf8(&line).map_err(|_| anyhow!("PROXY v1 line is not ascii"))?;
        ProxyHeader::parse_v1(line)
    }

    fn parse_v1(line: &str) -> Result<ProxyHeader> {
        let fields: Vec<&str> = line.split_ascii_whitespace().collect();
        match fields.as_slice() {
            ["TCP4", src, dst, src_port, dst_port] | ["TCP6", src, dst, src_port, dst_port] => {
                let source_addr = SocketAddr::new(src.parse()?, src_port.parse()?);
                let dest_addr = SocketAddr::new(dst.parse()?, dst_port.parse()?);
                Ok(ProxyHeader {
                    source_addr,
                    dest_addr,
                })
            }
            ["UNKNOWN", ..] => Err(anyhow!("PROXY v1 UNKNOWN connections are rejected")),
            _ => Err(anyhow!("malformed PROXY v1 line: {:?}", line)),
        }
    }

    fn parse_v2(fam_proto: u8, addr_data: &[u8]) -> Result<ProxyHeader> {
        let family = fam_proto >> 4;
        let protocol = fam_proto & 0x0F;

        // Trailing TLVs, if any, are ignored
        let (source_addr, dest_addr) = match (family, protocol) {
            (0x1, 0x1) => ProxyHeader::parse_tcp4(addr_data)?,
            (0x2, 0x1) => ProxyHeader::parse_tcp6(addr_data)?,
            _ => return Err(anyhow!("unsupported address family/protocol")),
        };

        Ok(ProxyHeader {
            source_addr,
            dest_addr,
        })
    }

    fn parse_tcp4(data: &[u8]) -> Result<(SocketAddr, SocketAddr)> {
        ensure!(data.len() >= 12, "invalid TCP4 address length");

        let src_ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
        let dst_ip = Ipv4Addr::new(data[4], data[5], data[6], data[7]);

        let src_port = u16::from_be_bytes([data[8], data[9]]);
        let dst_port = u16::from_be_bytes([data[10], data[11]]);

        Ok((
            SocketAddr::new(src_ip.into(), src_port),
            SocketAddr::new(dst_ip.into(), dst_port),
        ))
    }

    fn parse_tcp6(data: &[u8]) -> Result<(SocketAddr, SocketAddr)> {
        ensure!(data.len() >= 36, "invalid TCP6 address length");

        let src_ip = Ipv6Addr::from(<[u8; 16]>::try_from(&data[0..16])?);
        let dst_ip = Ipv6Addr::from(<[u8; 16]>::try_from(&data[16..32])?);

        let src_port = u16::from_be_bytes([data[32], data[33]]);
        let dst_port = u16::from_be_bytes([data[34], data[35]]);

        Ok((
            SocketAddr::new(src_ip.into(), src_port),
            SocketAddr::new(dst_ip.into(), dst_port),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Assemble a v2 preamble: the 12 byte signature, the version/command
    /// and family/protocol bytes, the length of the address block, and the
    /// block itself.
    fn v2_frame(ver_cmd: u8, fam_proto: u8, addr_block: &[u8]) -> Vec<u8> {
        let mut frame = PROXY_V2_SIGNATURE.to_vec();
        frame.push(ver_cmd);
        frame.push(fam_proto);
        frame.extend_from_slice(&(addr_block.len() as u16).to_be_bytes());
        frame.extend_from_slice(addr_block);
        frame
    }

    fn tcp4_block(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut block = Vec::new();
        block.extend_from_slice(&src);
        block.extend_from_slice(&dst);
        block.extend_from_slice(&src_port.to_be_bytes());
        block.extend_from_slice(&dst_port.to_be_bytes());
        block
    }

    async fn parse(frame: Vec<u8>) -> Result<ProxyHeader> {
        let mut stream = tokio::io::BufReader::new(std::io::Cursor::new(frame));
        ProxyHeader::read_from_stream(&mut stream).await
    }

    #[tokio::test]
    async fn test_proxy_v2_ipv4() {
        // 0x21 = v2 + PROXY, 0x11 = INET over STREAM
        let block = tcp4_block([203, 0, 113, 44], [192, 0, 2, 10], 53211, 443);
        let header = parse(v2_frame(0x21, 0x11, &block)).await.unwrap();
        assert_eq!(header.source_addr.to_string(), "203.0.113.44:53211");
        assert_eq!(header.dest_addr.to_string(), "192.0.2.10:443");
    }

    #[tokio::test]
    async fn test_proxy_v2_ipv6() {
        // 0x21 = INET6 over STREAM; two documentation range addresses
        let src: Ipv6Addr = "2001:db8:2::7".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8:5::1".parse().unwrap();
        let mut block = Vec::new();
        block.extend_from_slice(&src.octets());
        block.extend_from_slice(&dst.octets());
        block.extend_from_slice(&52000u16.to_be_bytes());
        block.extend_from_slice(&8443u16.to_be_bytes());

        let header = parse(v2_frame(0x21, 0x21, &block)).await.unwrap();
        assert_eq!(header.source_addr.to_string(), "[2001:db8:2::7]:52000");
        assert_eq!(header.dest_addr.to_string(), "[2001:db8:5::1]:8443");
    }

    #[tokio::test]
    async fn test_proxy_v2_ignores_tlvs() {
        // Anything past the address block is vendor TLV data we skip over
        let mut block = tcp4_block([203, 0, 113, 44], [192, 0, 2, 10], 53211, 443);
        block.extend_from_slice(&[0xEE, 0x00, 0x02, 0xAA, 0xBB]);
        let header = parse(v2_frame(0x21, 0x11, &block)).await.unwrap();
        assert_eq!(header.source_addr.to_string(), "203.0.113.44:53211");
    }

    #[tokio::test]
    async fn test_proxy_v1_tcp4() {
        let buf = b"PROXY TCP4 198.51.100.23 203.0.113.80 61234 80\r\nGET / HTTP/1.1\r\n".to_vec();
        let mut stream = tokio::io::BufReader::new(std::io::Cursor::new(buf));

        let info = ProxyHeader::read_from_stream(&mut stream).await.unwrap();
        assert_eq!(info.source_addr.to_string(), "198.51.100.23:61234");
        assert_eq!(info.dest_addr.to_string(), "203.0.113.80:80");

        // The request behind the preamble must still be there
        let mut rest = String::new();
        stream.read_to_string(&mut rest).await.unwrap();
        assert!(rest.starts_with("GET / HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_proxy_v1_tcp6() {
        let buf = b"PROXY TCP6 2001:db8:7::c 2001:db8::42 61234 80\r\n".to_vec();
        let mut stream = tokio::io::BufReader::new(std::io::Cursor::new(buf));

        let info = ProxyHeader::read_from_stream(&mut stream).await.unwrap();
        assert_eq!(info.source_addr.to_string(), "[2001:db8:7::c]:61234");
    }

    #[tokio::test]
    async fn test_proxy_v1_unknown_rejected() {
        let buf = b"PROXY UNKNOWN\r\n".to_vec();
        let mut stream = tokio::io::BufReader::new(std::io::Cursor::new(buf));
        assert!(ProxyHeader::read_from_stream(&mut stream).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_signature() {
        let err = parse(vec![0x00; 16]).await.unwrap_err();
        assert!(err.to_string().contains("invalid PROXY signature"));
    }

    #[tokio::test]
    async fn test_v1_version_byte_on_v2_signature() {
        let block = tcp4_block([203, 0, 113, 44], [192, 0, 2, 10], 53211, 443);
        let err = parse(v2_frame(0x11, 0x11, &block)).await.unwrap_err();
        assert!(err.to_string().contains("not PROXY protocol v2"));
    }

    #[tokio::test]
    async fn test_local_command_rejected() {
        // 0x20 = v2 with the LOCAL command, which carries no client address
        let block = tcp4_block([203, 0, 113, 44], [192, 0, 2, 10], 53211, 443);
        let err = parse(v2_frame(0x20, 0x11, &block)).await.unwrap_err();
        assert!(err.to_string().contains("unsupported PROXY command"));
    }

    #[tokio::test]
    async fn test_truncated_address_block() {
        // Declares a 12 byte block and then ends the stream
        let mut frame = PROXY_V2_SIGNATURE.to_vec();
        frame.extend_from_slice(&[0x21, 0x11, 0x00, 0x0C]);
        assert!(parse(frame).await.is_err());
    }

    #[tokio::test]
    async fn test_unsupported_family_rejected() {
        // 0x31 would be AF_UNIX, which no edge load balancer hands us
        let block = vec![0u8; 216];
        assert!(parse(v2_frame(0x21, 0x31, &block)).await.is_err());
    }
}
